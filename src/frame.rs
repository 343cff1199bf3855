// 该文件是 Shijing （视镜） 项目的一部分。
// src/frame.rs - 视频帧定义
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

use base64::{Engine as _, engine::general_purpose};
use image::{RgbImage, codecs::jpeg::JpegEncoder};

const JPEG_QUALITY: u8 = 90;

/// 解码得到的一帧 RGB 图像
#[derive(Debug, Clone)]
pub struct VideoFrame {
  /// 解码顺序中的位置（从 0 开始）
  pub index: u64,
  /// 显示时间戳（毫秒）
  pub timestamp_ms: u64,
  pub image: RgbImage,
}

impl VideoFrame {
  pub fn new(index: u64, timestamp_ms: u64, image: RgbImage) -> Self {
    Self {
      index,
      timestamp_ms,
      image,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  /// 按比例缩放帧，`factor` 为 1.0 时原样返回
  pub fn scaled(self, factor: f32) -> Self {
    if (factor - 1.0).abs() < f32::EPSILON || factor <= 0.0 {
      return self;
    }
    let width = ((self.width() as f32 * factor).round() as u32).max(1);
    let height = ((self.height() as f32 * factor).round() as u32).max(1);
    let image = image::imageops::resize(
      &self.image,
      width,
      height,
      image::imageops::FilterType::Triangle,
    );
    Self { image, ..self }
  }
}

/// 将图像编码为 JPEG 字节
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
  let mut bytes = Vec::new();
  let encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
  image.write_with_encoder(encoder)?;
  Ok(bytes)
}

/// 将图像编码为 base64 的 JPEG 字符串
pub fn encode_jpeg_base64(image: &RgbImage) -> Result<String, image::ImageError> {
  let bytes = encode_jpeg(image)?;
  Ok(general_purpose::STANDARD.encode(bytes))
}
