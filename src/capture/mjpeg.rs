// 该文件是 Shanan （山南西风） 项目的一部分。
// src/capture/mjpeg.rs - MJPEG 字节流采集
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

//! 从任意字节流中按 JPEG 的 SOI (`FF D8`) / EOI (`FF D9`) 标记切分帧。
//!
//! HTTP multipart MJPEG 流与相机实时预览流都是这种格式，
//! 两者只在建立连接的方式上不同。

use std::{io::Read, time::Instant};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capture::Capture;

const JPEG_SOI: [u8; 2] = [0xff, 0xd8];
const JPEG_EOI: [u8; 2] = [0xff, 0xd9];
const CHUNK_SIZE: usize = 75 * 1024;
// 缓冲区中找不到完整帧时的上限，防止异常流无限增长
const MAX_BUFFERED: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum MjpegCaptureError {
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  #[error("Invalid stream URL: {0}")]
  InvalidUrl(#[from] url::ParseError),
  #[cfg(feature = "http_input")]
  #[error("HTTP error: {0}")]
  HttpError(#[from] Box<ureq::Error>),
  #[cfg(feature = "http_input")]
  #[error("Digest authentication error: {0}")]
  DigestAuth(#[from] digest_auth::Error),
}

pub struct MjpegCapture<R> {
  reader: Option<R>,
  buffer: Vec<u8>,
  chunk: Box<[u8]>,
  last_frame: Option<Instant>,
  fps_estimate: f64,
}

impl<R: Read + Send> MjpegCapture<R> {
  pub fn new(reader: R) -> Self {
    Self {
      reader: Some(reader),
      buffer: Vec::new(),
      chunk: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
      last_frame: None,
      fps_estimate: 0.0,
    }
  }

  /// 读取直到缓冲区中出现一帧完整的 JPEG 数据
  fn next_jpeg(&mut self) -> Option<Vec<u8>> {
    loop {
      if let Some(jpeg) = split_jpeg(&mut self.buffer) {
        return Some(jpeg);
      }
      if self.buffer.len() > MAX_BUFFERED {
        warn!("MJPEG 缓冲区超过 {} 字节仍无完整帧，丢弃", MAX_BUFFERED);
        self.buffer.clear();
      }

      let reader = self.reader.as_mut()?;
      match reader.read(&mut self.chunk) {
        Ok(0) => {
          debug!("MJPEG 流结束");
          return None;
        }
        Ok(n) => self.buffer.extend_from_slice(&self.chunk[..n]),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
        Err(e) => {
          // 读超时同样视为流结束
          warn!("读取 MJPEG 流失败: {}", e);
          self.reader = None;
          return None;
        }
      }
    }
  }
}

/// 从缓冲区头部切出第一帧完整的 JPEG，并丢弃它之前的字节
fn split_jpeg(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
  let Some(start) = find_marker(buffer, &JPEG_SOI, 0) else {
    // 保留最后一个字节，它可能是被切开的标记前半部分
    let keep = buffer.len().min(1);
    buffer.drain(..buffer.len() - keep);
    return None;
  };
  let end = find_marker(buffer, &JPEG_EOI, start + JPEG_SOI.len())?;
  let jpeg = buffer[start..end + JPEG_EOI.len()].to_vec();
  buffer.drain(..end + JPEG_EOI.len());
  Some(jpeg)
}

fn find_marker(buffer: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
  buffer
    .get(from..)?
    .windows(marker.len())
    .position(|window| window == marker)
    .map(|pos| pos + from)
}

impl<R: Read + Send> Capture for MjpegCapture<R> {
  fn grab(&mut self) -> bool {
    self.next_jpeg().is_some()
  }

  fn read(&mut self) -> Option<RgbImage> {
    let jpeg = self.next_jpeg()?;
    let image = match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
      Ok(image) => image.to_rgb8(),
      Err(e) => {
        warn!("MJPEG 帧解码失败: {}", e);
        return None;
      }
    };

    let now = Instant::now();
    if let Some(last) = self.last_frame {
      let elapsed = now.duration_since(last).as_secs_f64();
      if elapsed > 0.0 {
        self.fps_estimate = 1.0 / elapsed;
      }
    }
    self.last_frame = Some(now);

    Some(image)
  }

  fn release(&mut self) {
    self.reader = None;
    self.buffer.clear();
  }

  fn fps(&self) -> f64 {
    (self.fps_estimate * 100.0).round() / 100.0
  }
}

#[cfg(feature = "http_input")]
const MJPEG_HTTP_PREFIX: &str = "mjpeg+";
#[cfg(feature = "http_input")]
const LIVE_PREVIEW_PREFIX: &str = "preview+";

#[cfg(feature = "http_input")]
pub(crate) fn is_mjpeg_scheme(scheme: &str) -> bool {
  [MJPEG_HTTP_PREFIX, LIVE_PREVIEW_PREFIX]
    .iter()
    .any(|prefix| {
      scheme
        .strip_prefix(prefix)
        .is_some_and(|inner| inner == "http" || inner == "https")
    })
}

#[cfg(feature = "http_input")]
const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// 打开 HTTP MJPEG 流或相机实时预览流
///
/// `mjpeg+http://` 以 GET 方式读取 multipart 流；
/// `preview+http://` 以 POST `{"name":"camera.getLivePreview"}` 开启预览。
/// 地址中带用户名时，先不带认证请求，收到 401 后按质询使用 Digest 认证，
/// 质询不是 Digest 时退回 Basic 认证。连接与每次读取都有超时。
#[cfg(feature = "http_input")]
pub(crate) fn open_http_stream(
  url: &url::Url,
) -> Result<MjpegCapture<Box<dyn Read + Send>>, MjpegCaptureError> {
  use tracing::info;

  let scheme = url.scheme();
  let (live_preview, inner_scheme) = if let Some(inner) = scheme.strip_prefix(LIVE_PREVIEW_PREFIX) {
    (true, inner)
  } else if let Some(inner) = scheme.strip_prefix(MJPEG_HTTP_PREFIX) {
    (false, inner)
  } else {
    return Err(MjpegCaptureError::SchemeMismatch(scheme.to_string()));
  };

  let mut target = url::Url::parse(&format!(
    "{}{}",
    inner_scheme,
    &url.as_str()[scheme.len()..]
  ))?;
  let credentials = (!url.username().is_empty()).then(|| Credentials {
    username: url.username().to_string(),
    password: url.password().unwrap_or_default().to_string(),
  });
  let _ = target.set_username("");
  let _ = target.set_password(None);

  let agent = ureq::AgentBuilder::new()
    .timeout_connect(HTTP_TIMEOUT)
    .timeout_read(HTTP_TIMEOUT)
    .build();
  let body = live_preview.then(|| serde_json::json!({ "name": "camera.getLivePreview" }).to_string());
  let send = |authorization: Option<&str>| {
    let request = match &body {
      Some(_) => agent
        .post(target.as_str())
        .set("Content-Type", "application/json;charset=utf-8"),
      None => agent.get(target.as_str()),
    };
    let request = match authorization {
      Some(value) => request.set("Authorization", value),
      None => request,
    };
    match &body {
      Some(body) => request.send_string(body),
      None => request.call(),
    }
  };

  let response = match (send(None), &credentials) {
    (Err(ureq::Error::Status(401, challenge)), Some(credentials)) => {
      let uri = &target[url::Position::BeforePath..];
      let authorization = match challenge.header("WWW-Authenticate") {
        Some(header) if is_digest_challenge(header) => {
          debug!("{} 要求 Digest 认证", target);
          let context = match &body {
            Some(body) => digest_auth::AuthContext::new_post(
              credentials.username.as_str(),
              credentials.password.as_str(),
              uri,
              Some(body.as_bytes()),
            ),
            None => digest_auth::AuthContext::new(
              credentials.username.as_str(),
              credentials.password.as_str(),
              uri,
            ),
          };
          digest_authorization(header, &context)?
        }
        _ => credentials.basic(),
      };
      send(Some(authorization.as_str())).map_err(Box::new)?
    }
    (response, _) => response.map_err(Box::new)?,
  };
  info!("打开 MJPEG 流 {}: HTTP {}", target, response.status());

  let reader: Box<dyn Read + Send> = Box::new(response.into_reader());
  Ok(MjpegCapture::new(reader))
}

#[cfg(feature = "http_input")]
struct Credentials {
  username: String,
  password: String,
}

#[cfg(feature = "http_input")]
impl Credentials {
  fn basic(&self) -> String {
    use base64::Engine;
    let token = format!("{}:{}", self.username, self.password);
    format!(
      "Basic {}",
      base64::engine::general_purpose::STANDARD.encode(token)
    )
  }
}

#[cfg(feature = "http_input")]
fn is_digest_challenge(header: &str) -> bool {
  header
    .trim_start()
    .get(..6)
    .is_some_and(|prefix| prefix.eq_ignore_ascii_case("digest"))
}

/// 按 `WWW-Authenticate` 质询计算 Digest 认证头
#[cfg(feature = "http_input")]
fn digest_authorization(
  challenge: &str,
  context: &digest_auth::AuthContext,
) -> Result<String, MjpegCaptureError> {
  let mut prompt = digest_auth::parse(challenge)?;
  Ok(prompt.respond(context)?.to_header_string())
}
