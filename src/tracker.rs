// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tracker.rs - 多目标跟踪
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

//! # 跟踪器
//!
//! 每一路源拥有自己的跟踪器实例，跟踪器只看到本源的检测框与帧。
//! 检测框的类别是融合后的复合类别，跟踪器只需原样带回。

use image::RgbImage;
use thiserror::Error;

use crate::{config::TrackerConfig, fusion::CompositeClass};

mod byte_track;
mod motion;

pub use self::byte_track::{ByteTracker, ByteTrackerParams};

/// 送入跟踪器的一个检测框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackInput {
  pub bbox: [f32; 4],
  pub score: f32,
  pub class: CompositeClass,
}

/// 跟踪器输出：检测框加上跟踪编号
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackOutput {
  pub bbox: [f32; 4],
  pub score: f32,
  pub class: CompositeClass,
  pub track_id: u64,
}

impl TrackOutput {
  pub fn from_input(input: &TrackInput, track_id: u64) -> Self {
    Self {
      bbox: input.bbox,
      score: input.score,
      class: input.class,
      track_id,
    }
  }
}

#[derive(Error, Debug)]
pub enum TrackerError {
  #[error("检测框无效: {0:?}")]
  InvalidBox([f32; 4]),
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidFrame { width: u32, height: u32 },
  #[error("跟踪器错误: {0}")]
  Backend(String),
}

/// 跟踪能力
pub trait Tracker: Send {
  /// 用本帧检测结果更新跟踪器，返回本帧被更新的轨迹
  fn update(
    &mut self,
    detections: &[TrackInput],
    frame: &RgbImage,
  ) -> Result<Vec<TrackOutput>, TrackerError>;
}

/// 为每一路源创建跟踪器
pub trait TrackerFactory: Send + Sync {
  /// 跟踪关闭时返回 `None`
  fn create(&self, config: &TrackerConfig) -> Option<Box<dyn Tracker>>;
}

/// 默认工厂：ByteTrack，`reid` 打开时附加外观匹配
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTrackFactory;

impl TrackerFactory for ByteTrackFactory {
  fn create(&self, config: &TrackerConfig) -> Option<Box<dyn Tracker>> {
    if !config.enabled {
      return None;
    }
    let params = ByteTrackerParams {
      reid: config.reid,
      ..Default::default()
    };
    Some(Box::new(ByteTracker::new(params)))
  }
}
