// 该文件是 Shanan （山南西风） 项目的一部分。
// src/channel.rs - 通道：多源多模型推理单元
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

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Arc,
  time::Instant,
};

use image::RgbImage;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  capture::{CaptureOpener, UrlCaptureOpener},
  config::{
    ChannelSpec, InferenceConfig, InferenceFailurePolicy, MAX_MODELS, MAX_SOURCES, PredictConfig,
    TrackerConfig,
  },
  error::{ChannelError, EntryKind},
  frame::blank_frame,
  fusion::{ModelView, fuse_source},
  governor::RateGovernor,
  model::{ModelLoader, ModelSlot, ModelSpec, NoBackendLoader},
  pool::WorkerPool,
  result::SourceResult,
  source::Source,
  tracker::{ByteTrackFactory, TrackerFactory},
};

/// 检查条目数量在 `1..=limit` 之内且名称不重复
fn check_entries<'a>(
  kind: EntryKind,
  names: impl ExactSizeIterator<Item = &'a String>,
  limit: usize,
) -> Result<(), ChannelError> {
  let requested = names.len();
  if requested == 0 || requested > limit {
    return Err(ChannelError::CapacityExceeded {
      kind,
      limit,
      requested,
    });
  }
  let mut seen = BTreeSet::new();
  for name in names {
    if !seen.insert(name) {
      return Err(ChannelError::DuplicateName {
        kind,
        name: name.clone(),
      });
    }
  }
  Ok(())
}

pub struct ChannelBuilder {
  sources: Vec<(String, Url)>,
  models: Vec<(String, ModelSpec)>,
  inference: InferenceConfig,
  tracker: TrackerConfig,
  failure_policy: InferenceFailurePolicy,
  opener: Arc<dyn CaptureOpener>,
  loader: Arc<dyn ModelLoader>,
  trackers: Arc<dyn TrackerFactory>,
}

impl Default for ChannelBuilder {
  fn default() -> Self {
    Self {
      sources: Vec::new(),
      models: Vec::new(),
      inference: InferenceConfig::default(),
      tracker: TrackerConfig::default(),
      failure_policy: InferenceFailurePolicy::default(),
      opener: Arc::new(UrlCaptureOpener),
      loader: Arc::new(NoBackendLoader),
      trackers: Arc::new(ByteTrackFactory),
    }
  }
}

impl ChannelBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_spec(spec: &ChannelSpec) -> Self {
    Self {
      sources: spec
        .sources
        .iter()
        .map(|(name, url)| (name.clone(), url.clone()))
        .collect(),
      models: spec
        .models
        .iter()
        .map(|(name, model)| (name.clone(), *model))
        .collect(),
      inference: spec.inference,
      tracker: spec.tracker,
      failure_policy: spec.failure_policy,
      ..Self::default()
    }
  }

  pub fn source(mut self, name: impl Into<String>, endpoint: Url) -> Self {
    self.sources.push((name.into(), endpoint));
    self
  }

  pub fn model(mut self, name: impl Into<String>, spec: ModelSpec) -> Self {
    self.models.push((name.into(), spec));
    self
  }

  pub fn inference(mut self, inference: InferenceConfig) -> Self {
    self.inference = inference;
    self
  }

  pub fn tracker(mut self, tracker: TrackerConfig) -> Self {
    self.tracker = tracker;
    self
  }

  pub fn failure_policy(mut self, policy: InferenceFailurePolicy) -> Self {
    self.failure_policy = policy;
    self
  }

  pub fn opener(mut self, opener: impl CaptureOpener + 'static) -> Self {
    self.opener = Arc::new(opener);
    self
  }

  pub fn loader(mut self, loader: impl ModelLoader + 'static) -> Self {
    self.loader = Arc::new(loader);
    self
  }

  pub fn tracker_factory(mut self, factory: impl TrackerFactory + 'static) -> Self {
    self.trackers = Arc::new(factory);
    self
  }

  /// 先校验全部参数，再打开采集源、加载模型
  pub fn build(self) -> Result<Channel, ChannelError> {
    check_entries(
      EntryKind::Source,
      self.sources.iter().map(|(name, _)| name),
      MAX_SOURCES,
    )?;
    check_entries(
      EntryKind::Model,
      self.models.iter().map(|(name, _)| name),
      MAX_MODELS,
    )?;
    self.inference.validate()?;

    let source_pool = WorkerPool::new("source", MAX_SOURCES)?;
    let model_pool = WorkerPool::new("model", MAX_MODELS)?;

    let mut channel = Channel {
      inference: self.inference,
      tracker: self.tracker,
      failure_policy: self.failure_policy,
      sources: BTreeMap::new(),
      models: BTreeMap::new(),
      governor: RateGovernor::new(),
      source_pool,
      model_pool,
      blank: blank_frame(),
      opener: self.opener,
      loader: self.loader,
      trackers: self.trackers,
    };

    for (name, endpoint) in self.sources {
      let source = channel.open_source(&name, endpoint)?;
      channel.sources.insert(name, source);
    }
    for (name, spec) in self.models {
      let slot = channel.load_model(&name, &spec)?;
      channel.models.insert(name, slot);
    }

    info!(
      "通道已创建: {} 路源, {} 个模型, 设备 {}",
      channel.sources.len(),
      channel.models.len(),
      channel.loader.device()
    );
    Ok(channel)
  }
}

/// 一个通道：一组共享推理节奏的源，以及一组并行运行的模型
///
/// `run` 与所有修改操作都需要 `&mut self`，因此同一通道上的周期不会重叠，
/// 配置修改也只会在两个周期之间生效。
pub struct Channel {
  inference: InferenceConfig,
  tracker: TrackerConfig,
  failure_policy: InferenceFailurePolicy,
  sources: BTreeMap<String, Source>,
  models: BTreeMap<String, ModelSlot>,
  governor: RateGovernor,
  source_pool: WorkerPool,
  model_pool: WorkerPool,
  blank: RgbImage,
  opener: Arc<dyn CaptureOpener>,
  loader: Arc<dyn ModelLoader>,
  trackers: Arc<dyn TrackerFactory>,
}

impl Channel {
  pub fn new<S, M>(
    sources: S,
    models: M,
    opener: impl CaptureOpener + 'static,
    loader: impl ModelLoader + 'static,
  ) -> Result<Self, ChannelError>
  where
    S: IntoIterator<Item = (String, Url)>,
    M: IntoIterator<Item = (String, ModelSpec)>,
  {
    let mut builder = ChannelBuilder::new().opener(opener).loader(loader);
    builder.sources.extend(sources);
    builder.models.extend(models);
    builder.build()
  }

  pub fn builder() -> ChannelBuilder {
    ChannelBuilder::new()
  }

  fn open_source(&self, name: &str, endpoint: Url) -> Result<Source, ChannelError> {
    let capture = self
      .opener
      .open(&endpoint)
      .map_err(|source| ChannelError::Capture {
        name: name.to_string(),
        source,
      })?;
    info!("打开源 {}: {}, 原生帧率 {}", name, endpoint, capture.fps());
    let tracker = self.trackers.create(&self.tracker);
    Ok(Source::new(endpoint, capture, tracker))
  }

  fn load_model(&self, name: &str, spec: &ModelSpec) -> Result<ModelSlot, ChannelError> {
    let backend = self
      .loader
      .load(name, spec)
      .map_err(|source| ChannelError::ModelLoad {
        name: name.to_string(),
        source,
      })?;
    info!("加载模型 {}: {} {}", name, spec.task, spec.weight);
    Ok(ModelSlot::new(spec, backend))
  }

  /// 修改推理配置，下一个周期生效；阈值越界时配置保持不变
  pub fn configure_inference(
    &mut self,
    confidence: f32,
    overlap: f32,
    augment: bool,
    realtime: bool,
  ) -> Result<(), ChannelError> {
    self.inference = InferenceConfig::new(confidence, overlap, augment, realtime)?;
    info!("推理配置已更新: {:?}", self.inference);
    Ok(())
  }

  /// 修改跟踪配置，并为每一路源重建跟踪器
  pub fn config_tracker(&mut self, enabled: bool, reid: bool) {
    self.tracker = TrackerConfig { enabled, reid };
    for source in self.sources.values_mut() {
      source.set_tracker(self.trackers.create(&self.tracker));
    }
    info!("跟踪配置已更新: {:?}", self.tracker);
  }

  pub fn set_failure_policy(&mut self, policy: InferenceFailurePolicy) {
    self.failure_policy = policy;
  }

  pub fn append_source(&mut self, name: impl Into<String>, endpoint: Url) -> Result<(), ChannelError> {
    let name = name.into();
    if self.sources.contains_key(&name) {
      return Err(ChannelError::AlreadyExists {
        kind: EntryKind::Source,
        name,
      });
    }
    if self.sources.len() >= MAX_SOURCES {
      return Err(ChannelError::CapacityExceeded {
        kind: EntryKind::Source,
        limit: MAX_SOURCES,
        requested: self.sources.len() + 1,
      });
    }
    let source = self.open_source(&name, endpoint)?;
    self.sources.insert(name, source);
    Ok(())
  }

  pub fn delete_source(&mut self, name: &str) -> Result<(), ChannelError> {
    match self.sources.remove(name) {
      Some(mut source) => {
        info!("删除源 {} ({})", name, source.endpoint());
        source.release();
        Ok(())
      }
      None => Err(ChannelError::NotFound {
        kind: EntryKind::Source,
        name: name.to_string(),
      }),
    }
  }

  pub fn append_model(&mut self, name: impl Into<String>, spec: ModelSpec) -> Result<(), ChannelError> {
    let name = name.into();
    if self.models.contains_key(&name) {
      return Err(ChannelError::AlreadyExists {
        kind: EntryKind::Model,
        name,
      });
    }
    if self.models.len() >= MAX_MODELS {
      return Err(ChannelError::CapacityExceeded {
        kind: EntryKind::Model,
        limit: MAX_MODELS,
        requested: self.models.len() + 1,
      });
    }
    let slot = self.load_model(&name, &spec)?;
    self.models.insert(name, slot);
    Ok(())
  }

  pub fn delete_model(&mut self, name: &str) -> Result<(), ChannelError> {
    match self.models.remove(name) {
      Some(_) => {
        info!("删除模型 {}", name);
        Ok(())
      }
      None => Err(ChannelError::NotFound {
        kind: EntryKind::Model,
        name: name.to_string(),
      }),
    }
  }

  pub fn source_names(&self) -> Vec<&str> {
    self.sources.keys().map(String::as_str).collect()
  }

  pub fn model_names(&self) -> Vec<&str> {
    self.models.keys().map(String::as_str).collect()
  }

  pub fn source(&self, name: &str) -> Option<&Source> {
    self.sources.get(name)
  }

  pub fn model(&self, name: &str) -> Option<&ModelSlot> {
    self.models.get(name)
  }

  /// 最近一个周期的处理速率（每秒周期数）
  pub fn processing_rate(&self) -> f64 {
    self.governor.rate()
  }

  pub fn inference_config(&self) -> InferenceConfig {
    self.inference
  }

  pub fn tracker_config(&self) -> TrackerConfig {
    self.tracker
  }

  pub fn failure_policy(&self) -> InferenceFailurePolicy {
    self.failure_policy
  }

  /// 运行一个周期，按源名称顺序为每一路活跃的源返回一条结果
  ///
  /// 流结束的源在采集阶段之后被移除，不会出现在结果中。
  /// 没有源时直接返回空列表，不调用任何模型。
  pub fn run(&mut self) -> Result<Vec<SourceResult>, ChannelError> {
    if self.sources.is_empty() {
      debug!("通道中没有源，跳过本周期");
      return Ok(Vec::new());
    }

    let started = Instant::now();
    let inference = self.inference;
    let policy = self.failure_policy;
    let governor = self.governor;

    // 采集
    let exhausted: Vec<String> = self
      .source_pool
      .fan_out(self.sources.iter_mut().collect(), |(name, source)| {
        let stride = governor.stride(source.native_fps(), inference.realtime);
        (!source.acquire(stride)).then(|| name.clone())
      })
      .into_iter()
      .flatten()
      .collect();
    for name in exhausted {
      if let Some(source) = self.sources.remove(&name) {
        info!("源 {} ({}) 的流已结束，移除", name, source.endpoint());
      }
    }
    let acquired = started.elapsed();

    if self.sources.is_empty() {
      self.governor.record(started.elapsed());
      return Ok(Vec::new());
    }

    // 推理
    let mut batch: Vec<&RgbImage> = self.sources.values().filter_map(Source::frame).collect();
    batch.resize(MAX_SOURCES, &self.blank);
    let predict = PredictConfig::new(&inference, self.loader.device());

    let failures: Vec<_> = self
      .model_pool
      .fan_out(self.models.iter_mut().collect(), |(name, slot)| {
        slot
          .predict(&batch, &predict)
          .err()
          .map(|e| (name.clone(), e))
      })
      .into_iter()
      .flatten()
      .collect();
    for (model, source) in failures {
      match policy {
        InferenceFailurePolicy::Abort => {
          return Err(ChannelError::ModelInference { model, source });
        }
        InferenceFailurePolicy::DropModel => {
          warn!("模型 {} 推理失败，本周期忽略其输出: {}", model, source);
        }
      }
    }
    let inferred = started.elapsed();

    // 融合与跟踪
    let views: Vec<ModelView<'_>> = self
      .models
      .iter()
      .map(|(name, slot)| ModelView::new(name, slot))
      .collect();
    let results: Vec<SourceResult> = self
      .source_pool
      .fan_out(
        self.sources.iter_mut().enumerate().collect(),
        |(slot, (name, source))| fuse_source(name, source, slot, &views),
      )
      .into_iter()
      .flatten()
      .collect();

    let elapsed = started.elapsed();
    self.governor.record(elapsed);
    debug!(
      "周期完成: 采集 {:.2?}, 推理 {:.2?}, 总计 {:.2?}, 处理速率 {:.2}",
      acquired,
      inferred - acquired,
      elapsed,
      self.governor.rate()
    );

    Ok(results)
  }

  fn shutdown(&mut self) {
    if self.sources.is_empty() && self.models.is_empty() {
      return;
    }
    info!(
      "关闭通道: 释放 {} 路源, {} 个模型",
      self.sources.len(),
      self.models.len()
    );
    self.sources.clear();
    self.models.clear();
  }

  /// 释放全部采集源与模型句柄
  pub fn close(mut self) {
    self.shutdown();
  }
}

impl Drop for Channel {
  fn drop(&mut self) {
    self.shutdown();
  }
}
