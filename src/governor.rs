// 该文件是 Shanan （山南西风） 项目的一部分。
// src/governor.rs - 处理速率与跳帧
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

use std::time::Duration;

use crate::result::round2;

/// 记录最近一个周期的处理速率，并据此计算每路源的跳帧步长
///
/// 实时模式下源以原生帧率产生帧，通道每秒只能处理 `rate` 个周期，
/// 因此每个周期需要跳过 `ceil(native / rate) - 1` 帧以保持同步。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateGovernor {
  rate: f64,
}

impl Default for RateGovernor {
  fn default() -> Self {
    Self {
      rate: f64::INFINITY,
    }
  }
}

impl RateGovernor {
  pub fn new() -> Self {
    Self::default()
  }

  /// 每秒周期数，第一个周期之前为正无穷
  pub fn rate(&self) -> f64 {
    self.rate
  }

  pub fn stride(&self, native_fps: f64, realtime: bool) -> u32 {
    if !realtime || !native_fps.is_finite() || native_fps <= 0.0 {
      return 1;
    }
    let stride = (native_fps / self.rate).ceil();
    if stride.is_finite() && stride > 1.0 {
      stride.min(u32::MAX as f64) as u32
    } else {
      1
    }
  }

  pub fn record(&mut self, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    self.rate = if secs > 0.0 { 1.0 / secs } else { f64::INFINITY };
  }
}

/// 跳帧后的有效帧率，保留两位小数
pub fn effective_rate(native_fps: f64, stride: u32) -> f64 {
  round2(native_fps / stride.max(1) as f64)
}
