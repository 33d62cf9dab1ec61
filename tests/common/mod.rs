// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/common/mod.rs - 集成测试公用的模拟源、模型与跟踪器
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

#![allow(dead_code)]

use std::sync::{
  Arc, Mutex,
  atomic::{AtomicBool, AtomicUsize, Ordering},
};

use image::{Rgb, RgbImage};
use url::Url;

use shanan_channel::{
  ChannelBuilder, InferenceConfig, PredictConfig, TrackerConfig, WORKING_SIZE,
  capture::{Capture, CaptureError, CaptureOpener},
  model::{
    DetectItem, DetectResult, InferenceBackend, ModelError, ModelLoader, ModelSpec, TaskKind,
    WeightClass,
  },
  tracker::{TrackInput, TrackOutput, Tracker, TrackerError, TrackerFactory},
};

/// 30fps 的测试片段；`frames` 为 `None` 时永不结束，画面为纯色 `[shade, 120, 150]`
pub struct ScriptedCapture {
  frames: Option<usize>,
  shade: u8,
  released: Arc<AtomicBool>,
}

impl Capture for ScriptedCapture {
  fn grab(&mut self) -> bool {
    self.next()
  }

  fn read(&mut self) -> Option<RgbImage> {
    self
      .next()
      .then(|| RgbImage::from_pixel(320, 240, Rgb([self.shade, 120, 150])))
  }

  fn release(&mut self) {
    self.released.store(true, Ordering::SeqCst);
  }

  fn fps(&self) -> f64 {
    30.0
  }
}

impl ScriptedCapture {
  fn next(&mut self) -> bool {
    if self.released.load(Ordering::SeqCst) {
      return false;
    }
    match &mut self.frames {
      None => true,
      Some(0) => false,
      Some(n) => {
        *n -= 1;
        true
      }
    }
  }
}

/// 按地址查询参数 `frames=N` 决定片段长度，`shade=N` 决定画面颜色
///
/// 克隆共享同一份记录，按打开顺序保存每个片段是否已被释放。
#[derive(Default, Clone)]
pub struct ScriptedOpener {
  opened: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl ScriptedOpener {
  pub fn released(&self) -> Vec<bool> {
    self
      .opened
      .lock()
      .unwrap()
      .iter()
      .map(|flag| flag.load(Ordering::SeqCst))
      .collect()
  }
}

fn query<T: std::str::FromStr>(endpoint: &Url, key: &str) -> Option<T> {
  endpoint
    .query_pairs()
    .find(|(k, _)| k == key)
    .and_then(|(_, v)| v.parse().ok())
}

impl CaptureOpener for ScriptedOpener {
  fn open(&self, endpoint: &Url) -> Result<Box<dyn Capture>, CaptureError> {
    if endpoint.scheme() != "clip" {
      return Err(CaptureError::SchemeMismatch(endpoint.scheme().to_string()));
    }
    let released = Arc::new(AtomicBool::new(false));
    self.opened.lock().unwrap().push(released.clone());
    Ok(Box::new(ScriptedCapture {
      frames: query(endpoint, "frames"),
      shade: query(endpoint, "shade").unwrap_or(90),
      released,
    }))
  }
}

pub fn clip(frames: Option<usize>) -> Url {
  match frames {
    Some(n) => Url::parse(&format!("clip://test?frames={}", n)).unwrap(),
    None => Url::parse("clip://test").unwrap(),
  }
}

pub fn shaded_clip(shade: u8, frames: Option<usize>) -> Url {
  let mut url = clip(frames);
  url.query_pairs_mut().append_pair("shade", &shade.to_string());
  url
}

/// 每次调用都返回同样的结果，并检查批次形状
pub struct FixedBackend {
  task: TaskKind,
  labels: Vec<String>,
  result: DetectResult,
  calls: Arc<AtomicUsize>,
}

impl InferenceBackend for FixedBackend {
  fn task(&self) -> TaskKind {
    self.task
  }

  fn labels(&self) -> &[String] {
    &self.labels
  }

  fn predict(
    &mut self,
    frames: &[&RgbImage],
    config: &PredictConfig,
  ) -> Result<Vec<DetectResult>, ModelError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if frames.len() != config.batch
      || frames
        .iter()
        .any(|f| f.dimensions() != (WORKING_SIZE, WORKING_SIZE))
    {
      return Err(ModelError::Backend("unexpected batch shape".into()));
    }
    Ok(vec![self.result.clone(); frames.len()])
  }
}

/// 读取每个批次位置的画面中心颜色，作为该位置检测框的 x1 返回
pub struct ShadeBackend {
  labels: Vec<String>,
}

impl InferenceBackend for ShadeBackend {
  fn task(&self) -> TaskKind {
    TaskKind::Detection
  }

  fn labels(&self) -> &[String] {
    &self.labels
  }

  fn predict(
    &mut self,
    frames: &[&RgbImage],
    _config: &PredictConfig,
  ) -> Result<Vec<DetectResult>, ModelError> {
    Ok(
      frames
        .iter()
        .map(|frame| {
          let shade = frame.get_pixel(WORKING_SIZE / 2, WORKING_SIZE / 2)[0] as f32;
          DetectResult {
            items: vec![DetectItem {
              class_id: 0,
              score: 0.9,
              bbox: [shade, 0.0, shade + 10.0, 10.0],
            }],
            ..Default::default()
          }
        })
        .collect(),
    )
  }
}

pub struct FailingBackend;

impl InferenceBackend for FailingBackend {
  fn task(&self) -> TaskKind {
    TaskKind::Detection
  }

  fn labels(&self) -> &[String] {
    &[]
  }

  fn predict(
    &mut self,
    _frames: &[&RgbImage],
    _config: &PredictConfig,
  ) -> Result<Vec<DetectResult>, ModelError> {
    Err(ModelError::Backend("device lost".into()))
  }
}

pub fn person_box() -> DetectResult {
  DetectResult {
    items: vec![DetectItem {
      class_id: 0,
      score: 0.9,
      bbox: [10.0, 10.0, 50.0, 50.0],
    }],
    ..Default::default()
  }
}

pub fn two_skeletons() -> DetectResult {
  DetectResult {
    keypoints: vec![
      vec![[100.4, 120.6], [110.0, 130.0]],
      vec![[300.0, 310.9], [320.2, 330.0]],
    ],
    ..Default::default()
  }
}

/// 检测模型返回一个 person 框，姿态模型返回两组关键点，
/// 名为 `Broken` 的模型总是失败，名为 `Shade` 的模型按画面颜色给出检测框
#[derive(Default, Clone)]
pub struct MockLoader {
  pub calls: Arc<AtomicUsize>,
}

impl ModelLoader for MockLoader {
  fn load(&self, name: &str, spec: &ModelSpec) -> Result<Box<dyn InferenceBackend>, ModelError> {
    match name {
      "Broken" => return Ok(Box::new(FailingBackend)),
      "Shade" => {
        return Ok(Box::new(ShadeBackend {
          labels: vec!["shade".to_string()],
        }));
      }
      _ => {}
    }
    let (labels, result) = match spec.task {
      TaskKind::Detection => (vec!["person".to_string()], person_box()),
      TaskKind::PoseEstimation => (vec!["person".to_string()], two_skeletons()),
      TaskKind::Segmentation => return Err(ModelError::UnsupportedTask(spec.task)),
    };
    Ok(Box::new(FixedBackend {
      task: spec.task,
      labels,
      result,
      calls: self.calls.clone(),
    }))
  }
}

pub struct FailingTracker;

impl Tracker for FailingTracker {
  fn update(
    &mut self,
    _detections: &[TrackInput],
    _frame: &RgbImage,
  ) -> Result<Vec<TrackOutput>, TrackerError> {
    Err(TrackerError::Backend("tracker crashed".into()))
  }
}

pub struct FailingTrackerFactory;

impl TrackerFactory for FailingTrackerFactory {
  fn create(&self, config: &TrackerConfig) -> Option<Box<dyn Tracker>> {
    config
      .enabled
      .then(|| Box::new(FailingTracker) as Box<dyn Tracker>)
  }
}

pub fn detection() -> ModelSpec {
  ModelSpec::new(TaskKind::Detection, WeightClass::Nano)
}

pub fn pose() -> ModelSpec {
  ModelSpec::new(TaskKind::PoseEstimation, WeightClass::Nano)
}

/// 关闭实时跳帧与跟踪的测试通道
pub fn builder(loader: &MockLoader) -> ChannelBuilder {
  builder_with(loader, &ScriptedOpener::default())
}

pub fn builder_with(loader: &MockLoader, opener: &ScriptedOpener) -> ChannelBuilder {
  ChannelBuilder::new()
    .opener(opener.clone())
    .loader(loader.clone())
    .inference(InferenceConfig {
      realtime: false,
      ..Default::default()
    })
    .tracker(TrackerConfig {
      enabled: false,
      reid: false,
    })
}
