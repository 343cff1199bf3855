// 该文件是 Shijing （视镜） 项目的一部分。
// src/model/medicine.rs - 药品包装文字识别
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::RgbImage;
use serde::Serialize;
use tracing::debug;

use crate::model::{FlorenceModel, FlorenceTask, Model, ModelError, TextRegion};

/// 一帧药品包装的识别结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MedicineReading {
  /// 整帧 OCR 文本
  pub full_text: String,
  /// 带位置的文字区域
  pub summary: Vec<TextRegion>,
}

/// 对每帧分别做整图 OCR 和带区域的 OCR
pub struct MedicineDetector {
  model: FlorenceModel,
}

impl MedicineDetector {
  pub fn new(model: FlorenceModel) -> Self {
    Self { model }
  }
}

impl Model for MedicineDetector {
  type Input = RgbImage;
  type Output = MedicineReading;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let full_text = self.model.run_task(FlorenceTask::Ocr, "", input)?.into_text()?;
    let summary = self
      .model
      .run_task(FlorenceTask::OcrWithRegion, "", input)?
      .into_regions()?;
    debug!("识别到 {} 个文字区域", summary.len());

    Ok(MedicineReading { full_text, summary })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_reading_serializes_fields() {
    let reading = MedicineReading {
      full_text: "DOLO 650".to_string(),
      summary: vec![TextRegion {
        quad_box: [0.0; 8],
        label: "DOLO".to_string(),
      }],
    };
    let value = serde_json::to_value(&reading).unwrap();
    assert_eq!(value["full_text"], "DOLO 650");
    assert_eq!(value["summary"][0]["label"], "DOLO");
  }
}
