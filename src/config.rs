// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 通道配置
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

use std::{collections::BTreeMap, fmt, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{error::ChannelError, model::ModelSpec};

/// 单个通道最多容纳的源数量，同时也是批次的固定大小
pub const MAX_SOURCES: usize = 16;
/// 单个通道最多容纳的模型数量
pub const MAX_MODELS: usize = 4;
/// 工作分辨率（正方形边长）
pub const WORKING_SIZE: u32 = 640;

/// 推理配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
  /// 置信度阈值 (0.0 - 1.0)
  pub confidence: f32,
  /// 重叠（NMS IOU）阈值 (0.0 - 1.0)
  pub overlap: f32,
  /// 测试时增强
  pub augment: bool,
  /// 实时模式：按处理速率跳帧
  pub realtime: bool,
}

impl Default for InferenceConfig {
  fn default() -> Self {
    Self {
      confidence: 0.25,
      overlap: 0.75,
      augment: true,
      realtime: true,
    }
  }
}

impl InferenceConfig {
  pub fn new(
    confidence: f32,
    overlap: f32,
    augment: bool,
    realtime: bool,
  ) -> Result<Self, ChannelError> {
    let config = Self {
      confidence,
      overlap,
      augment,
      realtime,
    };
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ChannelError> {
    check_unit_range("confidence", self.confidence)?;
    check_unit_range("overlap", self.overlap)
  }
}

fn check_unit_range(field: &'static str, value: f32) -> Result<(), ChannelError> {
  // NaN 也会落入这里
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(ChannelError::OutOfRange { field, value })
  }
}

/// 跟踪器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
  pub enabled: bool,
  /// 是否启用外观重识别
  pub reid: bool,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      reid: false,
    }
  }
}

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
  #[default]
  Cpu,
  Npu(u32),
}

impl Device {
  /// 非 CPU 设备使用半精度
  pub fn half(&self) -> bool {
    !matches!(self, Device::Cpu)
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Cpu => write!(f, "cpu"),
      Device::Npu(core) => write!(f, "npu:{}", core),
    }
  }
}

/// 每次批量推理传给后端的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictConfig {
  pub confidence: f32,
  pub overlap: f32,
  pub augment: bool,
  pub agnostic_nms: bool,
  pub half: bool,
  pub device: Device,
  pub batch: usize,
}

impl PredictConfig {
  pub fn new(inference: &InferenceConfig, device: Device) -> Self {
    Self {
      confidence: inference.confidence,
      overlap: inference.overlap,
      augment: inference.augment,
      agnostic_nms: true,
      half: device.half(),
      device,
      batch: MAX_SOURCES,
    }
  }
}

/// 单个模型推理失败时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceFailurePolicy {
  /// 整个周期失败，不返回任何部分结果
  #[default]
  Abort,
  /// 丢弃该模型本周期的输出，其余模型照常融合
  DropModel,
}

#[derive(Error, Debug)]
pub enum SpecError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(#[from] ChannelError),
}

/// 通道描述文件
///
/// ```json
/// {
///   "sources": { "gate": "gst://file/data/gate.mp4" },
///   "models": { "Default": { "task": "detection", "weight": "nano" } },
///   "inference": { "confidence": 0.3 },
///   "tracker": { "enabled": true, "reid": false }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSpec {
  pub sources: BTreeMap<String, Url>,
  pub models: BTreeMap<String, ModelSpec>,
  #[serde(default)]
  pub inference: InferenceConfig,
  #[serde(default)]
  pub tracker: TrackerConfig,
  #[serde(default)]
  pub failure_policy: InferenceFailurePolicy,
}

impl ChannelSpec {
  pub fn from_json(text: &str) -> Result<Self, SpecError> {
    let spec: ChannelSpec = serde_json::from_str(text)?;
    spec.inference.validate()?;
    Ok(spec)
  }

  pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, SpecError> {
    let text = std::fs::read_to_string(path)?;
    Self::from_json(&text)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{TaskKind, WeightClass};

  #[test]
  fn default_inference_matches_channel_defaults() {
    let config = InferenceConfig::default();
    assert_eq!(config.confidence, 0.25);
    assert_eq!(config.overlap, 0.75);
    assert!(config.augment);
    assert!(config.realtime);
  }

  #[test]
  fn thresholds_outside_unit_range_are_rejected() {
    assert!(InferenceConfig::new(1.5, 0.5, false, false).is_err());
    assert!(InferenceConfig::new(0.5, -0.1, false, false).is_err());
    assert!(InferenceConfig::new(f32::NAN, 0.5, false, false).is_err());
    assert!(InferenceConfig::new(0.0, 1.0, false, false).is_ok());
  }

  #[test]
  fn half_precision_follows_device() {
    let inference = InferenceConfig::default();
    assert!(!PredictConfig::new(&inference, Device::Cpu).half);
    let npu = PredictConfig::new(&inference, Device::Npu(0));
    assert!(npu.half);
    assert!(npu.agnostic_nms);
    assert_eq!(npu.batch, MAX_SOURCES);
  }

  #[test]
  fn spec_parses_with_defaults() {
    let spec = ChannelSpec::from_json(
      r#"{
        "sources": { "gate": "image:///tmp/gate.png" },
        "models": { "Pose": { "task": "estimation", "weight": "nano" } },
        "inference": { "confidence": 0.4 }
      }"#,
    )
    .unwrap();

    assert_eq!(spec.sources["gate"].scheme(), "image");
    assert_eq!(spec.models["Pose"].task, TaskKind::PoseEstimation);
    assert_eq!(spec.models["Pose"].weight, WeightClass::Nano);
    assert_eq!(spec.inference.confidence, 0.4);
    assert_eq!(spec.inference.overlap, 0.75);
    assert_eq!(spec.tracker, TrackerConfig::default());
    assert_eq!(spec.failure_policy, InferenceFailurePolicy::Abort);
  }

  #[test]
  fn spec_with_invalid_threshold_is_rejected() {
    let result = ChannelSpec::from_json(
      r#"{ "sources": {}, "models": {}, "inference": { "overlap": 2.0 } }"#,
    );
    assert!(matches!(
      result,
      Err(SpecError::Invalid(ChannelError::OutOfRange { field: "overlap", .. }))
    ));
  }
}
