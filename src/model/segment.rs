// 该文件是 Shijing （视镜） 项目的一部分。
// src/model/segment.rs - 分割掩码生成
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use base64::{Engine as _, engine::general_purpose};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::encode_jpeg_base64,
  geometry::BBox,
  model::{Endpoint, ModelError, check_status, http_client, timeout_from_url},
  pixelate::FaceMask,
};

/// 根据检测框生成像素级掩码
pub trait MaskGenerator: Send + Sync {
  fn generate(&self, image: &RgbImage, boxes: &[BBox]) -> Result<Vec<FaceMask>, ModelError>;
}

/// 直接把检测框（可按比例外扩）作为掩码，不调用模型
///
/// 地址形如 `box://?padding=0.1`。
#[derive(Debug, Clone, Default)]
pub struct BoxMaskGenerator {
  padding: f32,
}

impl FromUrlWithScheme for BoxMaskGenerator {
  const SCHEME: &'static str = "box";
}

impl FromUrl for BoxMaskGenerator {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::SchemeMismatch);
    }
    let padding = url
      .query_pairs()
      .find(|(k, _)| k == "padding")
      .and_then(|(_, v)| v.parse::<f32>().ok())
      .unwrap_or(0.0)
      .max(0.0);
    Ok(BoxMaskGenerator { padding })
  }
}

impl BoxMaskGenerator {
  fn padded(&self, bbox: &BBox) -> BBox {
    let dx = (bbox.x_max() - bbox.x_min()) * self.padding;
    let dy = (bbox.y_max() - bbox.y_min()) * self.padding;
    BBox::new(
      bbox.x_min() - dx,
      bbox.y_min() - dy,
      bbox.x_max() + dx,
      bbox.y_max() + dy,
    )
  }
}

impl MaskGenerator for BoxMaskGenerator {
  fn generate(&self, image: &RgbImage, boxes: &[BBox]) -> Result<Vec<FaceMask>, ModelError> {
    let (width, height) = image.dimensions();
    Ok(
      boxes
        .iter()
        .map(|bbox| FaceMask::from_bbox(width, height, &self.padded(bbox)))
        .collect(),
    )
  }
}

#[derive(Debug, Serialize)]
struct SegmentRequest<'a> {
  image: String,
  boxes: &'a [BBox],
  multimask_output: bool,
}

#[derive(Debug, Deserialize)]
struct SegmentResponse {
  masks: Vec<String>,
}

/// 通过 HTTP 调用的分割模型服务（SAM2）
///
/// 地址形如 `sam://host:port/sam2`，请求发送到 `<path>/segment`，
/// 每个检测框对应一张与原图同尺寸的 PNG 灰度掩码。
pub struct SamMaskClient {
  endpoint: Endpoint,
  client: reqwest::blocking::Client,
}

impl FromUrlWithScheme for SamMaskClient {
  const SCHEME: &'static str = "sam";
}

impl FromUrl for SamMaskClient {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::SchemeMismatch);
    }
    let endpoint = Endpoint::from_model_url(url, true)?;
    info!("分割模型 @ {}", endpoint.as_str());
    Ok(SamMaskClient {
      endpoint,
      client: http_client(timeout_from_url(url))?,
    })
  }
}

/// 解码服务返回的 base64 PNG 掩码并检查尺寸
fn decode_masks(
  encoded: &[String],
  width: u32,
  height: u32,
  expected: usize,
) -> Result<Vec<FaceMask>, ModelError> {
  if encoded.len() != expected {
    return Err(ModelError::UnexpectedOutput(format!(
      "期望 {} 个掩码, 得到 {}",
      expected,
      encoded.len()
    )));
  }

  encoded
    .iter()
    .map(|mask| {
      let bytes = general_purpose::STANDARD.decode(mask)?;
      let gray = image::load_from_memory(&bytes)?.to_luma8();
      if gray.dimensions() != (width, height) {
        return Err(ModelError::UnexpectedOutput(format!(
          "掩码尺寸 {:?} 与图像尺寸 {:?} 不一致",
          gray.dimensions(),
          (width, height)
        )));
      }
      Ok(FaceMask::from(&gray))
    })
    .collect()
}

impl MaskGenerator for SamMaskClient {
  fn generate(&self, image: &RgbImage, boxes: &[BBox]) -> Result<Vec<FaceMask>, ModelError> {
    if boxes.is_empty() {
      return Ok(Vec::new());
    }

    let request = SegmentRequest {
      image: encode_jpeg_base64(image)?,
      boxes,
      multimask_output: false,
    };
    let response = self
      .client
      .post(self.endpoint.join("segment"))
      .json(&request)
      .send()?;
    let SegmentResponse { masks } = check_status(response)?.json()?;
    debug!("分割模型返回 {} 个掩码", masks.len());

    let (width, height) = image.dimensions();
    decode_masks(&masks, width, height, boxes.len())
  }
}

/// 按地址方案选择的掩码生成器
pub enum MaskGeneratorWrapper {
  Box(BoxMaskGenerator),
  Sam(SamMaskClient),
}

impl FromUrl for MaskGeneratorWrapper {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      BoxMaskGenerator::SCHEME => Ok(MaskGeneratorWrapper::Box(BoxMaskGenerator::from_url(url)?)),
      SamMaskClient::SCHEME => Ok(MaskGeneratorWrapper::Sam(SamMaskClient::from_url(url)?)),
      _ => Err(ModelError::SchemeMismatch),
    }
  }
}

impl MaskGenerator for MaskGeneratorWrapper {
  fn generate(&self, image: &RgbImage, boxes: &[BBox]) -> Result<Vec<FaceMask>, ModelError> {
    match self {
      MaskGeneratorWrapper::Box(generator) => generator.generate(image, boxes),
      MaskGeneratorWrapper::Sam(generator) => generator.generate(image, boxes),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{GrayImage, Luma};
  use std::io::Cursor;

  fn png_base64(image: &GrayImage) -> String {
    let mut bytes = Vec::new();
    image
      .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
      .unwrap();
    general_purpose::STANDARD.encode(bytes)
  }

  #[test]
  fn test_box_masks_cover_boxes() {
    let image = RgbImage::new(10, 10);
    let masks = BoxMaskGenerator::default()
      .generate(&image, &[BBox::new(2.0, 2.0, 4.0, 5.0)])
      .unwrap();
    assert_eq!(masks.len(), 1);
    assert_eq!(masks[0].count(), 6);
    assert!(masks[0].get(2, 2));
    assert!(!masks[0].get(4, 2));
  }

  #[test]
  fn test_box_mask_padding() {
    let url = Url::parse("box://?padding=0.5").unwrap();
    let generator = BoxMaskGenerator::from_url(&url).unwrap();
    let image = RgbImage::new(20, 20);
    let masks = generator
      .generate(&image, &[BBox::new(8.0, 8.0, 12.0, 12.0)])
      .unwrap();
    // 4x4 外扩一半后为 8x8
    assert_eq!(masks[0].count(), 64);
  }

  #[test]
  fn test_decode_masks() {
    let mut gray = GrayImage::new(4, 3);
    gray.put_pixel(1, 1, Luma([255]));
    gray.put_pixel(2, 1, Luma([1]));
    let masks = decode_masks(&[png_base64(&gray)], 4, 3, 1).unwrap();
    assert_eq!(masks[0].count(), 2);
  }

  #[test]
  fn test_decode_masks_checks_count_and_size() {
    let gray = GrayImage::new(4, 3);
    assert!(decode_masks(&[png_base64(&gray)], 4, 3, 2).is_err());
    assert!(decode_masks(&[png_base64(&gray)], 5, 3, 1).is_err());
  }

  #[test]
  fn test_wrapper_selects_by_scheme() {
    let url = Url::parse("box://").unwrap();
    assert!(matches!(
      MaskGeneratorWrapper::from_url(&url),
      Ok(MaskGeneratorWrapper::Box(_))
    ));
    let url = Url::parse("mask://host").unwrap();
    assert!(MaskGeneratorWrapper::from_url(&url).is_err());
  }
}
