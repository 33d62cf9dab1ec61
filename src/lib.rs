// 该文件是 Shanan （山南西风） 项目的一部分。
// src/lib.rs - 库主文件
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

//! # Shanan 通道引擎
//!
//! 一个通道（channel）同时管理最多 16 路视频源与最多 4 个模型：
//! 每个周期并行采集各路帧，批量送入全部模型推理，融合多模型输出，
//! 按源驱动跟踪器，并为每一路活跃的源返回一条结果记录。
//!
//! 一个周期的流程：
//!
//! ```text
//! 源线程池（并行采集） → 填充批次 → 模型线程池（并行推理）
//!   → 融合与跟踪（按源并行） → 速率调节 → 结果列表
//! ```

pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod fusion;
pub mod governor;
pub mod model;
pub mod pool;
pub mod result;
pub mod source;
pub mod task;
pub mod tracker;

pub use channel::{Channel, ChannelBuilder};
pub use config::{
  ChannelSpec, Device, InferenceConfig, InferenceFailurePolicy, MAX_MODELS, MAX_SOURCES,
  PredictConfig, TrackerConfig, WORKING_SIZE,
};
pub use error::ChannelError;
pub use result::{Detection, SourceResult};

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}
