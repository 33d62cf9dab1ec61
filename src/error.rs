// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 通道错误定义
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

use thiserror::Error;

use crate::{capture::CaptureError, model::ModelError};

/// 通道内条目的种类，用于错误信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
  Source,
  Model,
}

impl fmt::Display for EntryKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EntryKind::Source => write!(f, "source"),
      EntryKind::Model => write!(f, "model"),
    }
  }
}

/// 通道错误
///
/// 配置类错误（容量、重名、不存在、越界）在修改任何状态之前同步返回；
/// `ModelInference` 是周期级错误，由调用方决定重试或停止通道。
#[derive(Error, Debug)]
pub enum ChannelError {
  #[error("{kind} capacity exceeded: a channel holds between 1 and {limit} {kind}s, got {requested}")]
  CapacityExceeded {
    kind: EntryKind,
    limit: usize,
    requested: usize,
  },
  #[error("duplicate {kind} name '{name}'")]
  DuplicateName { kind: EntryKind, name: String },
  #[error("{kind} '{name}' already exists")]
  AlreadyExists { kind: EntryKind, name: String },
  #[error("{kind} '{name}' does not exist")]
  NotFound { kind: EntryKind, name: String },
  #[error("{field} must be in range [0, 1], got {value}")]
  OutOfRange { field: &'static str, value: f32 },
  #[error("failed to open source '{name}': {source}")]
  Capture {
    name: String,
    #[source]
    source: CaptureError,
  },
  #[error("failed to load model '{name}': {source}")]
  ModelLoad {
    name: String,
    #[source]
    source: ModelError,
  },
  #[error("inference failed on model '{model}': {source}")]
  ModelInference {
    model: String,
    #[source]
    source: ModelError,
  },
  #[error("failed to build worker pool: {0}")]
  Pool(#[from] rayon::ThreadPoolBuildError),
}

impl ChannelError {
  /// 是否为配置类错误（调用被拒绝，通道状态未改变）
  pub fn is_configuration(&self) -> bool {
    matches!(
      self,
      ChannelError::CapacityExceeded { .. }
        | ChannelError::DuplicateName { .. }
        | ChannelError::AlreadyExists { .. }
        | ChannelError::NotFound { .. }
        | ChannelError::OutOfRange { .. }
    )
  }
}
