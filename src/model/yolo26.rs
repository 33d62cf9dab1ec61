// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolo26.rs - YOLO26 RKNN 推理后端
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use rknpu::{Context, InitFlags, TensorType};
use tracing::{debug, error, info};

use crate::{
  config::{Device, PredictConfig, WORKING_SIZE},
  frame::AsNhwcFrame,
  model::{
    DetectItem, DetectResult, InferenceBackend, ModelError, ModelLoader, ModelSpec, TaskKind,
    labels, non_max_suppression,
  },
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_W: f32 = WORKING_SIZE as f32;
const YOLO26_INPUT_H: f32 = WORKING_SIZE as f32;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];

impl From<rknpu::Error> for ModelError {
  fn from(err: rknpu::Error) -> Self {
    ModelError::RknnError(err)
  }
}

fn invalid(msg: String) -> ModelError {
  error!("{}", msg);
  ModelError::Backend(msg)
}

pub struct Yolo26 {
  context: Context,
  labels: Vec<String>,
}

pub struct Yolo26Builder {
  model_path: PathBuf,
  labels: Vec<String>,
  flags: InitFlags,
}

impl Yolo26Builder {
  pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      labels: labels::coco_labels(),
      flags: InitFlags::default(),
    }
  }

  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn labels(mut self, labels: Vec<String>) -> Self {
    self.labels = labels;
    self
  }

  pub fn build(self) -> Result<Yolo26, ModelError> {
    info!("加载模型文件: {}", self.model_path.display());
    let mode_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      mode_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&mode_data, self.flags)?;

    let num_inputs = context.num_inputs()?;
    let num_outputs = context.num_outputs()?;
    if num_inputs != YOLO26_NUM_INPUTS {
      return Err(invalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLO26_NUM_INPUTS, num_inputs
      )));
    }
    if num_outputs != YOLO26_NUM_OUTPUTS {
      return Err(invalid(format!(
        "预期模型输出数量为 {}, 实际为 {}",
        YOLO26_NUM_OUTPUTS, num_outputs
      )));
    }
    info!("模型加载完成");

    Ok(Yolo26 {
      context,
      labels: self.labels,
    })
  }
}

/// 根据张量大小匹配回归和分类输出
/// 返回 (reg, cls) 元组，如果大小不匹配则返回 None
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

impl Yolo26 {
  fn infer_one(&self, frame: &RgbImage, config: &PredictConfig) -> Result<DetectResult, ModelError> {
    self.context.set_input(
      0,
      frame.as_nhwc(),
      rknpu::TensorFormat::NHWC,
      TensorType::UInt8,
    )?;
    self.context.run()?;
    let output = self.context.get_outputs()?;

    let mut items = decode(&output, config.confidence);
    non_max_suppression(&mut items, config.overlap, config.agnostic_nms);
    Ok(DetectResult {
      items,
      ..Default::default()
    })
  }
}

fn decode(output: &rknpu::Output, confidence: f32) -> Vec<DetectItem> {
  let mut items = Vec::new();

  for (head_idx, (&(map_h, map_w), stride)) in
    YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
  {
    let spatial = map_h * map_w;
    let reg_expected = 4 * spatial;
    let cls_expected = YOLO26_CLASS_NUM * spatial;

    // RKNN 输出顺序不固定，按张量大小区分回归与分类
    let (Ok(tensor1), Ok(tensor2)) = (
      output.get_f32(head_idx * 2),
      output.get_f32(head_idx * 2 + 1),
    ) else {
      error!("检测头 {}: 获取输出失败", head_idx);
      continue;
    };
    let Some((reg, cls)) = match_reg_cls_tensors(tensor1, tensor2, reg_expected, cls_expected)
    else {
      error!(
        "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}",
        head_idx,
        tensor1.len(),
        tensor2.len()
      );
      continue;
    };

    for h in 0..map_h {
      for w in 0..map_w {
        let idx = h * map_w + w;

        let (score, class_id) = {
          let mut max_logit = f32::MIN;
          let mut cls_idx = 0usize;
          for c in 0..YOLO26_CLASS_NUM {
            let logit = cls[c * spatial + idx];
            if logit > max_logit {
              max_logit = logit;
              cls_idx = c;
            }
          }
          (sigmoid(max_logit), cls_idx as u32)
        };

        if score <= confidence {
          continue;
        }

        let grid_x = (w as f32) + 0.5;
        let grid_y = (h as f32) + 0.5;
        let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
        let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);
        let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
        let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);

        items.push(DetectItem {
          class_id,
          score,
          bbox: [xmin, ymin, xmax, ymax],
        });
      }
    }
  }

  items
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

impl InferenceBackend for Yolo26 {
  fn task(&self) -> TaskKind {
    TaskKind::Detection
  }

  fn labels(&self) -> &[String] {
    &self.labels
  }

  /// NPU 上下文一次只处理一帧，批次按顺序逐帧推理
  fn predict(
    &mut self,
    frames: &[&RgbImage],
    config: &PredictConfig,
  ) -> Result<Vec<DetectResult>, ModelError> {
    if config.augment {
      debug!("RKNN 后端不支持测试时增强，忽略");
    }
    frames
      .iter()
      .map(|frame| self.infer_one(frame, config))
      .collect()
  }
}

/// 从目录加载 `<name> <task> <weight>.rknn`，同名 `.labels` 文件存在时作为标签表
pub struct RknnModelLoader {
  model_dir: PathBuf,
  core: u32,
}

impl RknnModelLoader {
  pub fn new<P: AsRef<Path>>(model_dir: P) -> Self {
    Self {
      model_dir: model_dir.as_ref().to_path_buf(),
      core: 0,
    }
  }

  pub fn model_path(&self, name: &str, spec: &ModelSpec) -> PathBuf {
    self
      .model_dir
      .join(format!("{} {} {}.rknn", name, spec.task, spec.weight))
  }
}

impl ModelLoader for RknnModelLoader {
  fn device(&self) -> Device {
    Device::Npu(self.core)
  }

  fn load(&self, name: &str, spec: &ModelSpec) -> Result<Box<dyn InferenceBackend>, ModelError> {
    if spec.task != TaskKind::Detection {
      return Err(ModelError::UnsupportedTask(spec.task));
    }

    let model_path = self.model_path(name, spec);
    let labels_path = model_path.with_extension("labels");
    let mut builder = Yolo26Builder::new(&model_path);
    if labels_path.exists() {
      builder = builder.labels(labels::load_labels(&labels_path)?);
    }
    Ok(Box::new(builder.build()?))
  }
}
