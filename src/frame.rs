// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 工作分辨率帧处理
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

use std::io::Cursor;

use image::{ImageFormat, RgbImage, imageops::FilterType};
use thiserror::Error;

use crate::config::WORKING_SIZE;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("空帧: {width}x{height}")]
  EmptyFrame { width: u32, height: u32 },
  #[error("图像编码错误: {0}")]
  EncodeError(#[from] image::ImageError),
}

/// 以 NHWC（Height × Width × Channels）布局访问帧数据
pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

impl AsNhwcFrame for RgbImage {
  fn as_nhwc(&self) -> &[u8] {
    self.as_raw()
  }
}

/// 全零的工作分辨率帧，用于把批次补齐到固定大小
pub fn blank_frame() -> RgbImage {
  RgbImage::new(WORKING_SIZE, WORKING_SIZE)
}

/// 保持宽高比缩放到 `size`×`size`，居中放置，其余区域补零
pub fn letterbox(image: &RgbImage, size: u32) -> Result<RgbImage, FrameError> {
  let (width, height) = image.dimensions();
  if width == 0 || height == 0 {
    return Err(FrameError::EmptyFrame { width, height });
  }
  if width == size && height == size {
    return Ok(image.clone());
  }

  let aspect_ratio = width as f64 / height as f64;
  let (new_width, new_height) = if aspect_ratio > 1.0 {
    (size, ((size as f64 / aspect_ratio) as u32).max(1))
  } else {
    (((size as f64 * aspect_ratio) as u32).max(1), size)
  };

  let resized = image::imageops::resize(image, new_width, new_height, FilterType::Triangle);
  let mut output = RgbImage::new(size, size);
  let x_offset = (size - new_width) / 2;
  let y_offset = (size - new_height) / 2;
  image::imageops::replace(&mut output, &resized, x_offset as i64, y_offset as i64);

  Ok(output)
}

/// 编码为 JPEG，作为传输用的帧数据
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, FrameError> {
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, ImageFormat::Jpeg)?;
  Ok(buffer.into_inner())
}
