// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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

use std::fmt;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Device, PredictConfig};

/// 模型任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
  #[serde(rename = "detection")]
  Detection,
  #[serde(rename = "segmentation")]
  Segmentation,
  #[serde(rename = "estimation", alias = "pose")]
  PoseEstimation,
}

impl fmt::Display for TaskKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskKind::Detection => write!(f, "detection"),
      TaskKind::Segmentation => write!(f, "segmentation"),
      TaskKind::PoseEstimation => write!(f, "estimation"),
    }
  }
}

/// 模型规模，仅用于定位模型文件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WeightClass {
  Nano,
  Small,
  Medium,
  Large,
  #[serde(alias = "xlarge")]
  XLarge,
}

impl fmt::Display for WeightClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WeightClass::Nano => "nano",
      WeightClass::Small => "small",
      WeightClass::Medium => "medium",
      WeightClass::Large => "large",
      WeightClass::XLarge => "x-large",
    };
    write!(f, "{}", name)
  }
}

/// 通道中一个模型的描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
  pub task: TaskKind,
  pub weight: WeightClass,
}

impl ModelSpec {
  pub fn new(task: TaskKind, weight: WeightClass) -> Self {
    Self { task, weight }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，工作分辨率像素坐标
}

/// 单帧推理结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Vec<DetectItem>,
  /// 分割多边形，每个点为 [x, y]
  pub masks: Vec<Vec<[f32; 2]>>,
  /// 关键点组，每个点为 [x, y]
  pub keypoints: Vec<Vec<[f32; 2]>>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty() && self.masks.is_empty() && self.keypoints.is_empty()
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("后端错误: {0}")]
  Backend(String),
  #[error("批次结果数量不匹配: 期望 {expected}, 实际 {actual}")]
  BatchMismatch { expected: usize, actual: usize },
  #[error("不支持的任务类型: {0}")]
  UnsupportedTask(TaskKind),
  #[error("没有可用的推理后端")]
  NoBackend,
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[cfg(feature = "model_yolo26")]
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
}

/// 批量推理能力
///
/// `predict` 对每一帧输入返回一条结果，顺序与输入一致。
pub trait InferenceBackend: Send {
  fn task(&self) -> TaskKind;
  /// 本地类别序号到标签的映射表
  fn labels(&self) -> &[String];
  fn predict(
    &mut self,
    frames: &[&RgbImage],
    config: &PredictConfig,
  ) -> Result<Vec<DetectResult>, ModelError>;
}

/// 根据名称与描述加载推理后端
pub trait ModelLoader: Send + Sync {
  /// 推理设备，决定是否使用半精度
  fn device(&self) -> Device {
    Device::Cpu
  }

  fn load(&self, name: &str, spec: &ModelSpec) -> Result<Box<dyn InferenceBackend>, ModelError>;
}

/// 没有编译任何推理后端时使用的加载器
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackendLoader;

impl ModelLoader for NoBackendLoader {
  fn load(&self, _name: &str, _spec: &ModelSpec) -> Result<Box<dyn InferenceBackend>, ModelError> {
    Err(ModelError::NoBackend)
  }
}

/// 通道中的一个模型槽：后端句柄、标签表与最近一次的批量结果
pub struct ModelSlot {
  task: TaskKind,
  weight: WeightClass,
  backend: Box<dyn InferenceBackend>,
  labels: Vec<String>,
  results: Vec<DetectResult>,
}

impl ModelSlot {
  pub fn new(spec: &ModelSpec, backend: Box<dyn InferenceBackend>) -> Self {
    if backend.task() != spec.task {
      warn!(
        "模型后端任务类型 {} 与描述 {} 不一致",
        backend.task(),
        spec.task
      );
    }
    let labels = backend.labels().to_vec();
    Self {
      task: spec.task,
      weight: spec.weight,
      backend,
      labels,
      results: Vec::new(),
    }
  }

  pub fn task(&self) -> TaskKind {
    self.task
  }

  pub fn weight(&self) -> WeightClass {
    self.weight
  }

  pub fn labels(&self) -> &[String] {
    &self.labels
  }

  pub fn label(&self, class_id: u32) -> Option<&str> {
    self.labels.get(class_id as usize).map(String::as_str)
  }

  /// 最近一次批量推理的结果，推理失败或被清空时为空
  pub fn results(&self) -> &[DetectResult] {
    &self.results
  }

  /// 批次中第 `slot` 帧的结果
  pub fn result(&self, slot: usize) -> Option<&DetectResult> {
    self.results.get(slot)
  }

  /// 对整个批次推理并保存结果
  pub fn predict(&mut self, frames: &[&RgbImage], config: &PredictConfig) -> Result<(), ModelError> {
    self.results.clear();
    let results = self.backend.predict(frames, config)?;
    if results.len() != frames.len() {
      return Err(ModelError::BatchMismatch {
        expected: frames.len(),
        actual: results.len(),
      });
    }
    debug!(
      "{} 模型推理完成，共 {} 个检测框",
      self.task,
      results.iter().map(|r| r.items.len()).sum::<usize>()
    );
    self.results = results;
    Ok(())
  }
}

/// 两个框的交并比
pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let intersection = inter_w * inter_h;
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;
  if union <= 0.0 {
    0.0
  } else {
    intersection / union
  }
}

/// 非极大值抑制，`agnostic` 为真时不区分类别
pub fn non_max_suppression(items: &mut Vec<DetectItem>, iou_threshold: f32, agnostic: bool) {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut current_index = 0;
  for index in 0..items.len() {
    let mut drop = false;
    for prev_index in 0..current_index {
      let same_class = agnostic || items[prev_index].class_id == items[index].class_id;
      if same_class && box_iou(&items[prev_index].bbox, &items[index].bbox) > iou_threshold {
        drop = true;
        break;
      }
    }
    if !drop {
      items.swap(current_index, index);
      current_index += 1;
    }
  }
  items.truncate(current_index);
}

pub mod labels;

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{RknnModelLoader, Yolo26, Yolo26Builder};
