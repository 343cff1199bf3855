// 该文件是 Shijing （视镜） 项目的一部分。
// src/record.rs - 逐帧分析记录
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

use serde::Serialize;

use crate::{
  frame::encode_jpeg_base64,
  model::{Caption, ModelError},
  sampler::SampledFrame,
};

/// 一个被抽中的帧及其分析结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FrameRecord {
  pub frame_number: u64,
  /// 秒
  pub timestamp: f64,
  /// 推理失败时为 `null`
  pub caption: Option<Caption>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// base64 编码的 JPEG
  pub frame_image: String,
}

impl FrameRecord {
  pub fn new(sampled: &SampledFrame, result: Result<Caption, ModelError>) -> Result<Self, image::ImageError> {
    let (caption, error) = match result {
      Ok(caption) => (Some(caption), None),
      Err(e) => (None, Some(e.to_string())),
    };
    Ok(FrameRecord {
      frame_number: sampled.frame_number,
      timestamp: sampled.timestamp,
      caption,
      error,
      frame_image: encode_jpeg_base64(&sampled.frame.image)?,
    })
  }

  pub fn is_failed(&self) -> bool {
    self.error.is_some()
  }
}
