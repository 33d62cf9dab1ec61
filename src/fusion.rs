// 该文件是 Shanan （山南西风） 项目的一部分。
// src/fusion.rs - 多模型输出融合
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

//! # 融合
//!
//! 不同模型的类别序号互相重叠（两个模型都有类别 0），融合时每个框被标记为
//! `(模型序号, 本地类别)` 的复合类别，跟踪器只看到复合类别，
//! 输出前再由所属模型的标签表还原为文字标签。

use std::fmt;

use image::RgbImage;
use tracing::{error, warn};

use crate::{
  frame::encode_jpeg,
  model::{DetectResult, ModelSlot},
  result::{Detection, SourceResult},
  source::Source,
  tracker::{TrackInput, Tracker},
};

/// 融合后的类别：所属模型在通道中的序号与该模型的本地类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeClass {
  model: usize,
  class: u32,
}

impl CompositeClass {
  pub(crate) fn new(model_index: usize, class_id: u32) -> Self {
    Self {
      model: model_index,
      class: class_id,
    }
  }
}

impl fmt::Display for CompositeClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.model, self.class)
  }
}

/// 融合阶段看到的一个模型：名称、标签表和本周期的批量结果
pub struct ModelView<'a> {
  name: &'a str,
  labels: &'a [String],
  results: &'a [DetectResult],
}

impl<'a> ModelView<'a> {
  pub fn new(name: &'a str, slot: &'a ModelSlot) -> Self {
    Self {
      name,
      labels: slot.labels(),
      results: slot.results(),
    }
  }
}

#[derive(Debug, Default)]
pub(crate) struct Fused {
  pub boxes: Vec<TrackInput>,
  pub masks: Vec<Vec<[i32; 2]>>,
  pub keypoints: Vec<Vec<[i32; 2]>>,
}

fn to_points(points: &[[f32; 2]]) -> Vec<[i32; 2]> {
  points.iter().map(|p| p.map(|v| v as i32)).collect()
}

/// 按模型顺序收集批次中第 `slot` 帧的全部输出
pub(crate) fn gather(models: &[ModelView<'_>], slot: usize) -> Fused {
  let mut fused = Fused::default();
  for (index, model) in models.iter().enumerate() {
    let Some(result) = model.results.get(slot) else {
      continue;
    };
    fused
      .boxes
      .extend(result.items.iter().map(|item| TrackInput {
        bbox: item.bbox,
        score: item.score,
        class: CompositeClass::new(index, item.class_id),
      }));
    fused.masks.extend(result.masks.iter().map(|m| to_points(m)));
    fused
      .keypoints
      .extend(result.keypoints.iter().map(|k| to_points(k)));
  }
  fused
}

/// 驱动跟踪器；跟踪器出错或没有输出时保留原始检测框
pub(crate) fn track(
  source_name: &str,
  tracker: Option<&mut (dyn Tracker + 'static)>,
  boxes: Vec<TrackInput>,
  frame: &RgbImage,
) -> Vec<(TrackInput, Option<u64>)> {
  let untracked = |boxes: Vec<TrackInput>| -> Vec<(TrackInput, Option<u64>)> {
    boxes.into_iter().map(|b| (b, None)).collect()
  };
  let Some(tracker) = tracker else {
    return untracked(boxes);
  };
  if boxes.is_empty() {
    return Vec::new();
  }

  match tracker.update(&boxes, frame) {
    Ok(outputs) if !outputs.is_empty() => outputs
      .into_iter()
      .map(|o| {
        let input = TrackInput {
          bbox: o.bbox,
          score: o.score,
          class: o.class,
        };
        (input, Some(o.track_id))
      })
      .collect(),
    Ok(_) => untracked(boxes),
    Err(e) => {
      warn!("{}: 跟踪器更新失败，使用未跟踪的检测框: {}", source_name, e);
      untracked(boxes)
    }
  }
}

/// 复合类别还原为所属模型的标签，未知序号以数字作为标签
pub(crate) fn resolve_label(models: &[ModelView<'_>], class: CompositeClass) -> String {
  match models.get(class.model) {
    Some(model) => match model.labels.get(class.class as usize) {
      Some(label) => label.clone(),
      None => {
        warn!("模型 {} 没有类别 {} 的标签", model.name, class.class);
        class.class.to_string()
      }
    },
    None => {
      warn!("复合类别 {} 指向不存在的模型", class);
      class.class.to_string()
    }
  }
}

/// 生成一路源本周期的结果，帧编码失败时返回 `None`
pub fn fuse_source(
  source_name: &str,
  source: &mut Source,
  slot: usize,
  models: &[ModelView<'_>],
) -> Option<SourceResult> {
  let fused = gather(models, slot);
  let frame_rate = source.frame_rate();
  let (frame, tracker) = source.frame_and_tracker()?;
  let tracked = track(source_name, tracker, fused.boxes, frame);

  let boxes = tracked
    .into_iter()
    .map(|(b, track_id)| Detection::new(b.bbox, b.score, resolve_label(models, b.class), track_id))
    .collect();

  let jpeg = match encode_jpeg(frame) {
    Ok(jpeg) => jpeg,
    Err(e) => {
      error!("{}: 帧编码失败，丢弃本周期结果: {}", source_name, e);
      return None;
    }
  };

  Some(SourceResult {
    source_name: source_name.to_string(),
    frame: jpeg,
    boxes,
    masks: fused.masks,
    keypoints: fused.keypoints,
    frame_rate,
  })
}
