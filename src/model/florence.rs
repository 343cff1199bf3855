// 该文件是 Shijing （视镜） 项目的一部分。
// src/model/florence.rs - 任务提示词视觉模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::encode_jpeg_base64,
  geometry::BBox,
  model::{Endpoint, Model, ModelError, check_status, http_client, timeout_from_url},
};

const DEFAULT_MAX_NEW_TOKENS: u32 = 1024;
const DEFAULT_NUM_BEAMS: u32 = 3;

/// 任务提示词
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlorenceTask {
  Ocr,
  OcrWithRegion,
  ObjectDetection,
  PhraseGrounding,
  Caption,
}

impl FlorenceTask {
  pub fn token(&self) -> &'static str {
    match self {
      FlorenceTask::Ocr => "<OCR>",
      FlorenceTask::OcrWithRegion => "<OCR_WITH_REGION>",
      FlorenceTask::ObjectDetection => "<OD>",
      FlorenceTask::PhraseGrounding => "<CAPTION_TO_PHRASE_GROUNDING>",
      FlorenceTask::Caption => "<CAPTION>",
    }
  }
}

/// 带标签的检测框
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledBox {
  pub bbox: BBox,
  pub label: String,
}

/// 带文字的四边形区域，`quad_box` 为四个顶点 `[x1, y1, ..., x4, y4]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextRegion {
  pub quad_box: [f32; 8],
  pub label: String,
}

/// 解析后的任务输出
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
  Text(String),
  Boxes(Vec<LabeledBox>),
  Regions(Vec<TextRegion>),
}

impl TaskOutput {
  pub fn into_text(self) -> Result<String, ModelError> {
    match self {
      TaskOutput::Text(text) => Ok(text),
      other => Err(ModelError::UnexpectedOutput(format!("期望文本, 得到 {:?}", other))),
    }
  }

  pub fn into_boxes(self) -> Result<Vec<LabeledBox>, ModelError> {
    match self {
      TaskOutput::Boxes(boxes) => Ok(boxes),
      other => Err(ModelError::UnexpectedOutput(format!("期望检测框, 得到 {:?}", other))),
    }
  }

  pub fn into_regions(self) -> Result<Vec<TextRegion>, ModelError> {
    match self {
      TaskOutput::Regions(regions) => Ok(regions),
      other => Err(ModelError::UnexpectedOutput(format!("期望文字区域, 得到 {:?}", other))),
    }
  }
}

#[derive(Debug, Deserialize)]
struct BoxesPayload {
  bboxes: Vec<[f32; 4]>,
  labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegionsPayload {
  quad_boxes: Vec<[f32; 8]>,
  labels: Vec<String>,
}

/// 解析以任务提示词为键的后处理结果
pub fn parse_task_output(task: FlorenceTask, mut response: Value) -> Result<TaskOutput, ModelError> {
  let payload = response
    .get_mut(task.token())
    .map(Value::take)
    .ok_or_else(|| ModelError::UnexpectedOutput(format!("响应中缺少 {}", task.token())))?;

  match task {
    FlorenceTask::Ocr | FlorenceTask::Caption => match payload {
      Value::String(text) => Ok(TaskOutput::Text(text.trim().to_string())),
      other => Err(ModelError::UnexpectedOutput(format!("期望字符串, 得到 {}", other))),
    },
    FlorenceTask::ObjectDetection | FlorenceTask::PhraseGrounding => {
      let BoxesPayload { bboxes, labels } = serde_json::from_value(payload)?;
      if bboxes.len() != labels.len() {
        return Err(ModelError::UnexpectedOutput(format!(
          "检测框数量 {} 与标签数量 {} 不一致",
          bboxes.len(),
          labels.len()
        )));
      }
      Ok(TaskOutput::Boxes(
        bboxes
          .into_iter()
          .zip(labels)
          .map(|(bbox, label)| LabeledBox {
            bbox: BBox(bbox),
            label,
          })
          .collect(),
      ))
    }
    FlorenceTask::OcrWithRegion => {
      let RegionsPayload { quad_boxes, labels } = serde_json::from_value(payload)?;
      if quad_boxes.len() != labels.len() {
        return Err(ModelError::UnexpectedOutput(format!(
          "文字区域数量 {} 与标签数量 {} 不一致",
          quad_boxes.len(),
          labels.len()
        )));
      }
      Ok(TaskOutput::Regions(
        quad_boxes
          .into_iter()
          .zip(labels)
          .map(|(quad_box, label)| TextRegion {
            quad_box,
            label: label.replace("</s>", "").trim().to_string(),
          })
          .collect(),
      ))
    }
  }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
  task: &'a str,
  text: &'a str,
  image: String,
  max_new_tokens: u32,
  num_beams: u32,
}

/// 通过任务提示词驱动的视觉模型服务（Florence-2）
///
/// 地址形如 `florence://host:port/florence?num_beams=3&max_new_tokens=1024`，
/// 请求发送到 `<path>/generate`。
pub struct FlorenceModel {
  endpoint: Endpoint,
  client: reqwest::blocking::Client,
  max_new_tokens: u32,
  num_beams: u32,
}

impl FromUrlWithScheme for FlorenceModel {
  const SCHEME: &'static str = "florence";
}

impl FromUrl for FlorenceModel {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let query_u32 = |key: &str, default: u32| {
      url
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse::<u32>().ok())
        .unwrap_or(default)
    };
    let endpoint = Endpoint::from_model_url(url, true)?;
    info!("任务模型 @ {}", endpoint.as_str());

    Ok(FlorenceModel {
      endpoint,
      client: http_client(timeout_from_url(url))?,
      max_new_tokens: query_u32("max_new_tokens", DEFAULT_MAX_NEW_TOKENS),
      num_beams: query_u32("num_beams", DEFAULT_NUM_BEAMS),
    })
  }
}

impl FlorenceModel {
  /// 执行一次任务，`text` 会追加在任务提示词之后
  pub fn run_task(
    &self,
    task: FlorenceTask,
    text: &str,
    image: &RgbImage,
  ) -> Result<TaskOutput, ModelError> {
    debug!("执行任务 {} {}", task.token(), text);
    let request = GenerateRequest {
      task: task.token(),
      text,
      image: encode_jpeg_base64(image)?,
      max_new_tokens: self.max_new_tokens,
      num_beams: self.num_beams,
    };

    let response = self
      .client
      .post(self.endpoint.join("generate"))
      .json(&request)
      .send()?;
    let value: Value = check_status(response)?.json()?;
    debug!("任务 {} 输出: {}", task.token(), value);
    parse_task_output(task, value)
  }
}

/// 只输出文本的单一任务（OCR 或描述）
pub struct FlorenceText {
  model: FlorenceModel,
  task: FlorenceTask,
}

impl FlorenceText {
  pub fn new(model: FlorenceModel, task: FlorenceTask) -> Self {
    Self { model, task }
  }
}

impl Model for FlorenceText {
  type Input = RgbImage;
  type Output = String;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.model.run_task(self.task, "", input)?.into_text()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_ocr() {
    let output = parse_task_output(FlorenceTask::Ocr, json!({"<OCR>": " PARACETAMOL\n500mg "})).unwrap();
    assert_eq!(output, TaskOutput::Text("PARACETAMOL\n500mg".to_string()));
  }

  #[test]
  fn test_parse_object_detection() {
    let response = json!({
      "<OD>": {
        "bboxes": [[10.0, 20.0, 110.0, 140.0], [300.5, 40.0, 360.0, 100.0]],
        "labels": ["human face", "car"]
      }
    });
    let boxes = parse_task_output(FlorenceTask::ObjectDetection, response)
      .unwrap()
      .into_boxes()
      .unwrap();
    assert_eq!(boxes.len(), 2);
    assert_eq!(boxes[0].label, "human face");
    assert_eq!(boxes[0].bbox, BBox::new(10.0, 20.0, 110.0, 140.0));
    assert_eq!(boxes[1].label, "car");
  }

  #[test]
  fn test_parse_grounding_uses_its_own_key() {
    let response = json!({"<OD>": {"bboxes": [], "labels": []}});
    assert!(parse_task_output(FlorenceTask::PhraseGrounding, response).is_err());
  }

  #[test]
  fn test_parse_rejects_mismatched_lengths() {
    let response = json!({"<OD>": {"bboxes": [[0.0, 0.0, 1.0, 1.0]], "labels": []}});
    assert!(matches!(
      parse_task_output(FlorenceTask::ObjectDetection, response),
      Err(ModelError::UnexpectedOutput(_))
    ));
  }

  #[test]
  fn test_parse_ocr_with_region() {
    let response = json!({
      "<OCR_WITH_REGION>": {
        "quad_boxes": [[1.0, 2.0, 30.0, 2.0, 30.0, 12.0, 1.0, 12.0]],
        "labels": ["</s>EXP 12/2025"]
      }
    });
    let regions = parse_task_output(FlorenceTask::OcrWithRegion, response)
      .unwrap()
      .into_regions()
      .unwrap();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].label, "EXP 12/2025");
    assert_eq!(regions[0].quad_box[2], 30.0);
  }

  #[test]
  fn test_parse_ocr_with_region_rejects_mismatched_lengths() {
    let response = json!({
      "<OCR_WITH_REGION>": {
        "quad_boxes": [[1.0, 2.0, 30.0, 2.0, 30.0, 12.0, 1.0, 12.0]],
        "labels": ["EXP 12/2025", "MRP 35.00"]
      }
    });
    assert!(matches!(
      parse_task_output(FlorenceTask::OcrWithRegion, response),
      Err(ModelError::UnexpectedOutput(_))
    ));
  }

  #[test]
  fn test_wrong_output_kind() {
    assert!(TaskOutput::Text("x".into()).into_boxes().is_err());
    assert!(TaskOutput::Boxes(vec![]).into_text().is_err());
  }
}
