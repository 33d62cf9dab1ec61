// 该文件是 Shanan （山南西风） 项目的一部分。
// src/capture/read_image_file.rs - 图像文件采集
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, capture::Capture};

#[derive(Error, Debug)]
pub enum ImageFileCaptureError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 静态图片源：第一次 `grab`/`read` 产生这张图片，之后即为流结束
pub struct ImageFileCapture {
  image: Option<RgbImage>,
}

impl FromUrlWithScheme for ImageFileCapture {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileCapture {
  type Error = ImageFileCaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileCaptureError::SchemaMismatch);
    }

    let path = url.path();
    let image = ImageReader::open(path)?.decode()?;
    debug!("读取图片 {}: {}x{}", path, image.width(), image.height());

    Ok(ImageFileCapture::from_image(image.into()))
  }
}

impl ImageFileCapture {
  pub fn from_image(image: RgbImage) -> Self {
    Self { image: Some(image) }
  }
}

impl Capture for ImageFileCapture {
  fn grab(&mut self) -> bool {
    self.image.take().is_some()
  }

  fn read(&mut self) -> Option<RgbImage> {
    self.image.take()
  }

  fn release(&mut self) {
    self.image = None;
  }

  fn fps(&self) -> f64 {
    0.0
  }
}
