// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tracker/byte_track.rs - ByteTrack 跟踪器
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! ByteTrack：高分框优先按 IoU 匹配，低分框用来找回未匹配的轨迹。
//! 打开 `reid` 时，每条轨迹额外保存一个颜色直方图外观特征，
//! 既参与第一轮匹配的代价，也用于找回 IoU 已经对不上的丢失轨迹。

use image::RgbImage;
use tracing::trace;

use super::{Tracker, TrackerError, TrackInput, TrackOutput, motion::MotionFilter};
use crate::{fusion::CompositeClass, model::box_iou};

const HISTOGRAM_BINS: usize = 4;
const FEATURE_LEN: usize = HISTOGRAM_BINS * HISTOGRAM_BINS * HISTOGRAM_BINS;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteTrackerParams {
  /// 高分检测阈值，只有高分框会新建轨迹
  pub high_score_threshold: f32,
  /// 低分检测阈值，低于此值的框直接忽略
  pub low_score_threshold: f32,
  pub high_iou_threshold: f32,
  pub low_iou_threshold: f32,
  /// 连续丢失超过该帧数的轨迹被删除
  pub max_lost_frames: u32,
  pub reid: bool,
  /// 外观找回所需的最小余弦相似度
  pub reid_similarity: f32,
  /// 第一轮匹配代价中外观所占权重
  pub reid_weight: f32,
}

impl Default for ByteTrackerParams {
  fn default() -> Self {
    Self {
      high_score_threshold: 0.4,
      low_score_threshold: 0.1,
      high_iou_threshold: 0.3,
      low_iou_threshold: 0.2,
      max_lost_frames: 30,
      reid: false,
      reid_similarity: 0.9,
      reid_weight: 0.3,
    }
  }
}

struct Track {
  id: u64,
  class: CompositeClass,
  filter: MotionFilter,
  frames_lost: u32,
  appearance: Option<Vec<f32>>,
}

impl Track {
  fn update(&mut self, det: &TrackInput, appearance: Option<Vec<f32>>) {
    self.filter.update(&det.bbox);
    self.frames_lost = 0;
    self.appearance = match (self.appearance.take(), appearance) {
      (Some(old), Some(new)) => Some(blend(&old, &new)),
      (old, new) => new.or(old),
    };
  }
}

pub struct ByteTracker {
  params: ByteTrackerParams,
  tracks: Vec<Track>,
  next_id: u64,
}

impl ByteTracker {
  pub fn new(params: ByteTrackerParams) -> Self {
    Self {
      params,
      tracks: Vec::new(),
      next_id: 1,
    }
  }

  pub fn track_count(&self) -> usize {
    self.tracks.len()
  }

  /// 贪心匹配，返回 (检测序号, 轨迹序号)
  fn associate(
    &self,
    det_indices: &[usize],
    track_indices: &[usize],
    detections: &[TrackInput],
    features: &[Option<Vec<f32>>],
    iou_threshold: f32,
    use_appearance: bool,
  ) -> Vec<(usize, usize)> {
    let mut candidates = Vec::new();
    for &d in det_indices {
      for &t in track_indices {
        let track = &self.tracks[t];
        if track.class != detections[d].class {
          continue;
        }
        // 滤波器已在本帧预测过，直接用当前状态
        let iou = box_iou(&detections[d].bbox, &track.filter.bbox());
        if iou < iou_threshold {
          continue;
        }
        let mut cost = 1.0 - iou;
        if use_appearance
          && let (Some(a), Some(b)) = (&features[d], &track.appearance)
        {
          let w = self.params.reid_weight;
          cost = (1.0 - w) * cost + w * (1.0 - cosine(a, b));
        }
        candidates.push((cost, d, t));
      }
    }
    greedy(candidates)
  }

  /// 外观找回：IoU 已失配的丢失轨迹按外观相似度匹配
  fn recover(
    &self,
    det_indices: &[usize],
    track_indices: &[usize],
    detections: &[TrackInput],
    features: &[Option<Vec<f32>>],
  ) -> Vec<(usize, usize)> {
    let mut candidates = Vec::new();
    for &d in det_indices {
      let Some(a) = &features[d] else { continue };
      for &t in track_indices {
        let track = &self.tracks[t];
        if track.frames_lost == 0 || track.class != detections[d].class {
          continue;
        }
        let Some(b) = &track.appearance else { continue };
        let similarity = cosine(a, b);
        if similarity >= self.params.reid_similarity {
          candidates.push((1.0 - similarity, d, t));
        }
      }
    }
    greedy(candidates)
  }
}

fn greedy(mut candidates: Vec<(f32, usize, usize)>) -> Vec<(usize, usize)> {
  candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
  let mut used_det = Vec::new();
  let mut used_track = Vec::new();
  let mut assignments = Vec::new();
  for (_, d, t) in candidates {
    if !used_det.contains(&d) && !used_track.contains(&t) {
      used_det.push(d);
      used_track.push(t);
      assignments.push((d, t));
    }
  }
  assignments
}

impl Tracker for ByteTracker {
  fn update(
    &mut self,
    detections: &[TrackInput],
    frame: &RgbImage,
  ) -> Result<Vec<TrackOutput>, TrackerError> {
    if frame.width() == 0 || frame.height() == 0 {
      return Err(TrackerError::InvalidFrame {
        width: frame.width(),
        height: frame.height(),
      });
    }
    if let Some(bad) = detections
      .iter()
      .find(|d| !d.bbox.iter().all(|v| v.is_finite()) || d.bbox[2] < d.bbox[0] || d.bbox[3] < d.bbox[1])
    {
      return Err(TrackerError::InvalidBox(bad.bbox));
    }

    for track in &mut self.tracks {
      track.filter.predict();
    }

    let features: Vec<Option<Vec<f32>>> = detections
      .iter()
      .map(|d| {
        if self.params.reid {
          appearance(frame, &d.bbox)
        } else {
          None
        }
      })
      .collect();

    let (high, low): (Vec<usize>, Vec<usize>) = (0..detections.len())
      .filter(|&i| detections[i].score >= self.params.low_score_threshold)
      .partition(|&i| detections[i].score >= self.params.high_score_threshold);

    let mut det_track: Vec<Option<usize>> = vec![None; detections.len()];
    let mut track_matched = vec![false; self.tracks.len()];

    // 第一轮：高分框与全部轨迹
    let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
    for (d, t) in self.associate(
      &high,
      &all_tracks,
      detections,
      &features,
      self.params.high_iou_threshold,
      self.params.reid,
    ) {
      det_track[d] = Some(t);
      track_matched[t] = true;
    }

    // 第二轮：低分框找回剩余轨迹
    let remaining: Vec<usize> = all_tracks.iter().copied().filter(|&t| !track_matched[t]).collect();
    for (d, t) in self.associate(
      &low,
      &remaining,
      detections,
      &features,
      self.params.low_iou_threshold,
      false,
    ) {
      det_track[d] = Some(t);
      track_matched[t] = true;
    }

    // 第三轮：外观找回
    if self.params.reid {
      let remaining: Vec<usize> = all_tracks.iter().copied().filter(|&t| !track_matched[t]).collect();
      let unmatched_high: Vec<usize> = high.iter().copied().filter(|&d| det_track[d].is_none()).collect();
      for (d, t) in self.recover(&unmatched_high, &remaining, detections, &features) {
        det_track[d] = Some(t);
        track_matched[t] = true;
      }
    }

    let mut features = features;
    for (d, slot) in det_track.iter().enumerate() {
      if let Some(t) = *slot {
        self.tracks[t].update(&detections[d], features[d].take());
      }
    }
    for (t, matched) in track_matched.iter().enumerate() {
      if !matched {
        self.tracks[t].frames_lost += 1;
      }
    }

    // 未匹配的高分框新建轨迹
    for &d in &high {
      if det_track[d].is_none() {
        det_track[d] = Some(self.tracks.len());
        self.tracks.push(Track {
          id: self.next_id,
          class: detections[d].class,
          filter: MotionFilter::new(&detections[d].bbox, 0.1, 0.5),
          frames_lost: 0,
          appearance: features[d].take(),
        });
        self.next_id += 1;
      }
    }

    let outputs = det_track
      .iter()
      .enumerate()
      .filter_map(|(d, slot)| {
        let track = &self.tracks[(*slot)?];
        Some(TrackOutput {
          bbox: track.filter.bbox(),
          score: detections[d].score,
          class: detections[d].class,
          track_id: track.id,
        })
      })
      .collect();

    let max_lost = self.params.max_lost_frames;
    self.tracks.retain(|t| t.frames_lost <= max_lost);
    trace!("当前轨迹数 {}", self.tracks.len());

    Ok(outputs)
  }
}

/// 检测框区域的归一化 RGB 直方图
fn appearance(frame: &RgbImage, bbox: &[f32; 4]) -> Option<Vec<f32>> {
  let x0 = bbox[0].max(0.0) as u32;
  let y0 = bbox[1].max(0.0) as u32;
  let x1 = (bbox[2].max(0.0) as u32).min(frame.width());
  let y1 = (bbox[3].max(0.0) as u32).min(frame.height());
  if x1 <= x0 || y1 <= y0 {
    return None;
  }

  let mut histogram = vec![0.0f32; FEATURE_LEN];
  let shift = 8 - HISTOGRAM_BINS.trailing_zeros();
  for y in y0..y1 {
    for x in x0..x1 {
      let [r, g, b] = frame.get_pixel(x, y).0;
      let bin = ((r >> shift) as usize * HISTOGRAM_BINS + (g >> shift) as usize) * HISTOGRAM_BINS
        + (b >> shift) as usize;
      histogram[bin] += 1.0;
    }
  }
  normalize(&mut histogram);
  Some(histogram)
}

fn normalize(feature: &mut [f32]) {
  let norm = feature.iter().map(|v| v * v).sum::<f32>().sqrt();
  if norm > 0.0 {
    feature.iter_mut().for_each(|v| *v /= norm);
  }
}

fn blend(old: &[f32], new: &[f32]) -> Vec<f32> {
  let mut feature: Vec<f32> = old.iter().zip(new).map(|(a, b)| 0.9 * a + 0.1 * b).collect();
  normalize(&mut feature);
  feature
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
  a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn input(bbox: [f32; 4], score: f32) -> TrackInput {
    TrackInput {
      bbox,
      score,
      class: CompositeClass::new(0, 0),
    }
  }

  #[test]
  fn persistent_box_keeps_its_id() {
    let frame = RgbImage::new(640, 640);
    let mut tracker = ByteTracker::new(ByteTrackerParams::default());
    let mut ids = Vec::new();
    for step in 0..5 {
      let x = 100.0 + step as f32 * 2.0;
      let out = tracker
        .update(&[input([x, 100.0, x + 50.0, 200.0], 0.9)], &frame)
        .unwrap();
      assert_eq!(out.len(), 1);
      ids.push(out[0].track_id);
    }
    assert!(ids.iter().all(|&id| id == ids[0]));
  }

  #[test]
  fn distinct_boxes_get_distinct_ids() {
    let frame = RgbImage::new(640, 640);
    let mut tracker = ByteTracker::new(ByteTrackerParams::default());
    let out = tracker
      .update(
        &[
          input([0.0, 0.0, 50.0, 50.0], 0.9),
          input([300.0, 300.0, 400.0, 400.0], 0.8),
        ],
        &frame,
      )
      .unwrap();
    assert_eq!(out.len(), 2);
    assert_ne!(out[0].track_id, out[1].track_id);
  }

  #[test]
  fn low_score_box_does_not_start_a_track() {
    let frame = RgbImage::new(640, 640);
    let mut tracker = ByteTracker::new(ByteTrackerParams::default());
    let out = tracker
      .update(&[input([0.0, 0.0, 50.0, 50.0], 0.2)], &frame)
      .unwrap();
    assert!(out.is_empty());
    assert_eq!(tracker.track_count(), 0);
  }

  #[test]
  fn lost_tracks_expire() {
    let frame = RgbImage::new(640, 640);
    let mut tracker = ByteTracker::new(ByteTrackerParams {
      max_lost_frames: 2,
      ..Default::default()
    });
    tracker
      .update(&[input([0.0, 0.0, 50.0, 50.0], 0.9)], &frame)
      .unwrap();
    for _ in 0..3 {
      tracker.update(&[], &frame).unwrap();
    }
    assert_eq!(tracker.track_count(), 0);
  }

  #[test]
  fn reid_recovers_a_jumped_track() {
    let mut frame = RgbImage::new(640, 640);
    for y in 0..640 {
      for x in 0..640 {
        frame.put_pixel(x, y, Rgb([200, 30, 30]));
      }
    }
    let mut tracker = ByteTracker::new(ByteTrackerParams {
      reid: true,
      ..Default::default()
    });
    let first = tracker
      .update(&[input([0.0, 0.0, 50.0, 50.0], 0.9)], &frame)
      .unwrap();
    tracker.update(&[], &frame).unwrap();
    let second = tracker
      .update(&[input([400.0, 400.0, 450.0, 450.0], 0.9)], &frame)
      .unwrap();
    assert_eq!(first[0].track_id, second[0].track_id);
  }

  #[test]
  fn moving_box_keeps_its_id_when_it_stops() {
    let frame = RgbImage::new(640, 640);
    let mut tracker = ByteTracker::new(ByteTrackerParams::default());
    let mut x = 100.0;
    let mut positions = vec![x];
    for step in 1..=10 {
      x += (2.0 * step as f32).min(6.0);
      positions.push(x);
    }
    positions.extend([x; 5]);

    let ids: Vec<u64> = positions
      .iter()
      .map(|&x| {
        let out = tracker
          .update(&[input([x, 100.0, x + 20.0, 200.0], 0.9)], &frame)
          .unwrap();
        out[0].track_id
      })
      .collect();
    assert!(ids.iter().all(|&id| id == ids[0]));
    assert_eq!(tracker.track_count(), 1);
  }

  #[test]
  fn invalid_input_is_an_error() {
    let mut tracker = ByteTracker::new(ByteTrackerParams::default());
    assert!(matches!(
      tracker.update(&[input([0.0, 0.0, 1.0, 1.0], 0.9)], &RgbImage::new(0, 0)),
      Err(TrackerError::InvalidFrame { .. })
    ));
    assert!(matches!(
      tracker.update(
        &[input([f32::NAN, 0.0, 1.0, 1.0], 0.9)],
        &RgbImage::new(4, 4)
      ),
      Err(TrackerError::InvalidBox(_))
    ));
  }
}
