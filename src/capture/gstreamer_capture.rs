// 该文件是 Shanan （山南西风） 项目的一部分。
// src/capture/gstreamer_capture.rs - GStreamer 采集
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

//! # GStreamer 采集
//!
//! 本地视频文件、摄像头与通用网络流（RTSP/HTTP）都通过 GStreamer 管道读取。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## 地址格式
//!
//! - `gst://file/data/video.mp4?rotate=90`
//! - `gst://camera/dev/video0?width=1280&height=720&fps=30&format=YUY2`
//! - `gst://stream?uri=rtsp://192.168.1.100:8554/stream`
//!
//! 文件源不丢帧（appsink 阻塞上游），摄像头与网络流只保留最新的两帧。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, capture::Capture};

#[derive(Error, Debug)]
pub enum GStreamerCaptureError {
  /// URI scheme 不匹配（期望 "gst://"）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Missing query parameter: {0}")]
  MissingParameter(&'static str),
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

pub enum GStreamerCaptureBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  StreamSource(String),
  TargetFormat {
    format: String,
  },
  VideoFlip {
    method: u32,
    direction: u32,
  },
}

impl GStreamerCaptureBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerCaptureBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", path)
      }
      GStreamerCaptureBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode_str = if let Some(mode) = io_mode {
          format!(" io-mode={}", mode)
        } else {
          "".to_string()
        };
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          camera, io_mode_str, format, width, height, fps
        )
      }
      GStreamerCaptureBuilderItem::StreamSource(uri) => {
        format!("uridecodebin uri={}", uri)
      }
      GStreamerCaptureBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerCaptureBuilderItem::VideoFlip { method, direction } => {
        format!("videoflip method={} video-direction={}", method, direction)
      }
    }
  }
}

/// GStreamer 采集管道构建器
pub struct GStreamerCaptureBuilder {
  items: Vec<GStreamerCaptureBuilderItem>,
  live: bool,
}

impl GStreamerCaptureBuilder {
  fn build_camera_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let camera = path.to_string();
    let io_mode = query.get("io-mode").and_then(|v| v.parse::<u32>().ok());
    let format = query
      .get("format")
      .map(String::from)
      .unwrap_or(String::from("YUY2"));
    let width = query
      .get("width")
      .and_then(|v| v.parse::<u32>().ok())
      .unwrap_or(640);
    let height = query
      .get("height")
      .and_then(|v| v.parse::<u32>().ok())
      .unwrap_or(480);
    let fps = query
      .get("fps")
      .and_then(|v| v.parse::<u32>().ok())
      .unwrap_or(30);

    GStreamerCaptureBuilder {
      items: vec![GStreamerCaptureBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      }],
      live: true,
    }
  }

  fn build_file_pipeline(path: &str) -> Self {
    GStreamerCaptureBuilder {
      items: vec![GStreamerCaptureBuilderItem::FileSource(path.to_string())],
      live: false,
    }
  }

  fn build_stream_pipeline(
    query: &HashMap<String, String>,
  ) -> Result<Self, GStreamerCaptureError> {
    let uri = query
      .get("uri")
      .ok_or(GStreamerCaptureError::MissingParameter("uri"))?;
    Ok(GStreamerCaptureBuilder {
      items: vec![GStreamerCaptureBuilderItem::StreamSource(uri.clone())],
      live: true,
    })
  }

  fn video_flip(rotate: Option<&str>) -> Option<GStreamerCaptureBuilderItem> {
    let (method, direction) = match rotate? {
      "90" => (1, 1),
      "180" => (2, 2),
      "270" => (3, 3),
      _ => return None,
    };
    Some(GStreamerCaptureBuilderItem::VideoFlip { method, direction })
  }

  pub fn description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerCaptureBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    if self.live {
      format!(
        "{} ! appsink name=sink sync=false max-buffers=2 drop=true",
        basic_pipeline
      )
    } else {
      format!(
        "{} ! appsink name=sink sync=false max-buffers=2 drop=false",
        basic_pipeline
      )
    }
  }

  pub fn build(self) -> Result<GStreamerCapture, GStreamerCaptureError> {
    gst::init()?;

    let full_pipeline = self.description();
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerCaptureError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerCaptureError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerCaptureError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerCapture {
      pipeline: Some(pipeline),
      appsink,
      fps: 0.0,
    })
  }
}

impl FromUrlWithScheme for GStreamerCaptureBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerCaptureBuilder {
  type Error = GStreamerCaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerCaptureError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = match url.host_str() {
      Some("camera") => Self::build_camera_pipeline(url.path(), &query),
      Some("file") => Self::build_file_pipeline(url.path()),
      Some("stream") => Self::build_stream_pipeline(&query)?,
      _ => {
        return Err(GStreamerCaptureError::SchemeMismatch);
      }
    };

    if let Some(video_flip) = Self::video_flip(query.get("rotate").map(|s| s.as_ref())) {
      builder.items.push(video_flip);
    }
    builder.items.push(GStreamerCaptureBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    });

    Ok(builder)
  }
}

/// GStreamer 采集源
///
/// 原生帧率取自最近一次拉取到的 caps，首帧之前为 0。
pub struct GStreamerCapture {
  pipeline: Option<gst::Pipeline>,
  appsink: gst_app::AppSink,
  fps: f64,
}

impl Drop for GStreamerCapture {
  fn drop(&mut self) {
    self.release();
  }
}

impl GStreamerCapture {
  fn pull_sample(&mut self) -> Option<gst::Sample> {
    self.pipeline.as_ref()?;
    match self.appsink.pull_sample() {
      Ok(sample) => {
        self.update_fps(&sample);
        Some(sample)
      }
      Err(e) => {
        if self.appsink.is_eos() {
          debug!("GStreamer 流结束");
        } else {
          warn!("Failed to pull sample: {}", e);
        }
        None
      }
    }
  }

  fn update_fps(&mut self, sample: &gst::Sample) {
    let Some(caps) = sample.caps() else {
      return;
    };
    if let Ok(info) = gst_video::VideoInfo::from_caps(caps) {
      let fps = info.fps();
      if fps.numer() > 0 && fps.denom() > 0 {
        self.fps = fps.numer() as f64 / fps.denom() as f64;
      }
    }
  }
}

impl Capture for GStreamerCapture {
  fn grab(&mut self) -> bool {
    self.pull_sample().is_some()
  }

  fn read(&mut self) -> Option<RgbImage> {
    let sample = self.pull_sample()?;
    convert_sample_to_rgb(&sample)
      .map_err(|e| {
        warn!("Failed to convert sample: {}", e);
        e
      })
      .ok()
  }

  fn release(&mut self) {
    if let Some(pipeline) = self.pipeline.take()
      && let Err(e) = pipeline.set_state(gst::State::Null)
    {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }

  fn fps(&self) -> f64 {
    self.fps
  }
}

fn convert_sample_to_rgb(sample: &gst::Sample) -> Result<RgbImage, GStreamerCaptureError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerCaptureError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerCaptureError::PipelineError("No caps in sample".to_string()))?;
  let video_info = gst_video::VideoInfo::from_caps(caps)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable()?;
  let data = map.as_slice();
  if data.len() < stride * (height.saturating_sub(1)) + width * 3 {
    return Err(GStreamerCaptureError::PipelineError(format!(
      "Buffer too small: {} bytes for {}x{} (stride {})",
      data.len(),
      width,
      height,
      stride
    )));
  }

  let mut pixels = Vec::with_capacity(width * height * 3);
  for h in 0..height {
    let row = &data[h * stride..h * stride + width * 3];
    match video_info.format() {
      gst_video::VideoFormat::Rgb => pixels.extend_from_slice(row),
      gst_video::VideoFormat::Bgr => {
        for pixel in row.chunks_exact(3) {
          pixels.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
        }
      }
      _ => {
        return Err(GStreamerCaptureError::PipelineError(
          "Unsupported video format".to_string(),
        ));
      }
    }
  }

  RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| GStreamerCaptureError::PipelineError("Frame size mismatch".to_string()))
}
