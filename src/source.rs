// 该文件是 Shanan （山南西风） 项目的一部分。
// src/source.rs - 通道中的一路源
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

use image::RgbImage;
use tracing::{debug, warn};
use url::Url;

use crate::{
  capture::Capture,
  config::WORKING_SIZE,
  frame::letterbox,
  governor::effective_rate,
  tracker::Tracker,
};

/// 一路源：独占的采集句柄、独占的跟踪器和本周期的帧
pub struct Source {
  endpoint: Url,
  capture: Box<dyn Capture>,
  tracker: Option<Box<dyn Tracker>>,
  frame: Option<RgbImage>,
  frame_rate: f64,
}

impl Source {
  pub fn new(endpoint: Url, capture: Box<dyn Capture>, tracker: Option<Box<dyn Tracker>>) -> Self {
    Self {
      endpoint,
      capture,
      tracker,
      frame: None,
      frame_rate: 0.0,
    }
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  pub fn native_fps(&self) -> f64 {
    self.capture.fps()
  }

  pub fn frame(&self) -> Option<&RgbImage> {
    self.frame.as_ref()
  }

  pub fn frame_rate(&self) -> f64 {
    self.frame_rate
  }

  pub fn has_tracker(&self) -> bool {
    self.tracker.is_some()
  }

  pub fn set_tracker(&mut self, tracker: Option<Box<dyn Tracker>>) {
    self.tracker = tracker;
  }

  /// 本周期的帧与跟踪器，没有帧时返回 `None`
  pub(crate) fn frame_and_tracker(
    &mut self,
  ) -> Option<(&RgbImage, Option<&mut (dyn Tracker + 'static)>)> {
    let frame = self.frame.as_ref()?;
    Some((frame, self.tracker.as_deref_mut()))
  }

  /// 跳过 `stride - 1` 帧后读取一帧并缩放到工作分辨率
  ///
  /// 返回 `false` 表示流已结束，此时采集句柄已被释放。
  pub fn acquire(&mut self, stride: u32) -> bool {
    self.frame = None;
    for _ in 1..stride {
      if !self.capture.grab() {
        self.capture.release();
        return false;
      }
    }
    let Some(raw) = self.capture.read() else {
      self.capture.release();
      return false;
    };

    match letterbox(&raw, WORKING_SIZE) {
      Ok(frame) => {
        self.frame = Some(frame);
        self.frame_rate = effective_rate(self.capture.fps(), stride);
        true
      }
      Err(e) => {
        // 空帧视为流结束
        warn!("{}: 无法缩放帧: {}", self.endpoint, e);
        self.capture.release();
        false
      }
    }
  }

  pub fn release(&mut self) {
    self.frame = None;
    self.capture.release();
  }
}

impl Drop for Source {
  fn drop(&mut self) {
    debug!("释放源 {}", self.endpoint);
    self.release();
  }
}
