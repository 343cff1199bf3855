// 该文件是 Shijing （视镜） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Duration;

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::FromUrl;

/// 模型推理接口
///
/// 所有模型都通过 HTTP 调用外部推理服务，实现本身不持有可变状态。
pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("HTTP 请求错误: {0}")]
  HttpError(#[from] reqwest::Error),
  #[error("模型服务返回 {status}: {body}")]
  StatusError { status: u16, body: String },
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("base64 解码错误: {0}")]
  Base64Error(#[from] base64::DecodeError),
  #[error("模型输出不符合预期: {0}")]
  UnexpectedOutput(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// 由模型地址推导出的 HTTP 服务地址
///
/// `ollama://127.0.0.1:11434/...` 对应 `http://127.0.0.1:11434`，
/// 查询参数 `tls=1` 时使用 https。
#[derive(Debug, Clone)]
pub struct Endpoint {
  base: Url,
}

impl Endpoint {
  /// `keep_path` 为真时把地址路径作为服务前缀
  pub fn from_model_url(url: &Url, keep_path: bool) -> Result<Self, ModelError> {
    let host = url
      .host_str()
      .ok_or_else(|| ModelError::ModelPathError(format!("地址缺少主机名: {}", url)))?;
    let tls = url
      .query_pairs()
      .any(|(k, v)| k == "tls" && (v == "1" || v == "true"));
    let scheme = if tls { "https" } else { "http" };
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = if keep_path {
      url.path().trim_end_matches('/')
    } else {
      ""
    };

    let base = Url::parse(&format!("{}://{}{}{}", scheme, host, port, path))
      .map_err(|e| ModelError::ModelPathError(format!("{}: {}", url, e)))?;
    Ok(Endpoint { base })
  }

  pub fn join(&self, suffix: &str) -> String {
    let base = self.base.as_str().trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    if suffix.is_empty() {
      return base.to_string();
    }
    format!("{}/{}", base, suffix)
  }

  pub fn as_str(&self) -> &str {
    self.base.as_str()
  }
}

/// 读取地址中的 `timeout` 参数（秒）
pub fn timeout_from_url(url: &Url) -> Duration {
  let seconds = url
    .query_pairs()
    .find(|(k, _)| k == "timeout")
    .and_then(|(_, v)| v.parse::<u64>().ok())
    .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
  Duration::from_secs(seconds)
}

/// 创建阻塞式 HTTP 客户端
///
/// 必须在异步运行时之外创建和释放。
pub fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, ModelError> {
  let client = reqwest::blocking::Client::builder()
    .timeout(timeout)
    .build()?;
  Ok(client)
}

/// 检查响应状态，非 2xx 时读取响应体作为错误信息
pub fn check_status(
  response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, ModelError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().unwrap_or_default();
  error!("模型服务返回错误 {}: {}", status, body);
  Err(ModelError::StatusError {
    status: status.as_u16(),
    body,
  })
}

/// 单帧分析结果
///
/// 具体形态取决于接入的模型。
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Caption {
  Text(String),
  Chat(ChatResponse),
  Medicine(MedicineReading),
}

/// 对单帧图像给出文字结果的模型
pub trait FrameAnalyzer: Send + Sync {
  fn analyze(&self, image: &RgbImage) -> Result<Caption, ModelError>;
}

impl<M> FrameAnalyzer for M
where
  M: Model<Input = RgbImage, Output = Caption, Error = ModelError> + Send + Sync,
{
  fn analyze(&self, image: &RgbImage) -> Result<Caption, ModelError> {
    self.infer(image)
  }
}

mod caption;
mod florence;
mod medicine;
mod ollama;
mod segment;

pub use self::caption::CaptionModel;
pub use self::florence::{FlorenceModel, FlorenceTask, FlorenceText, LabeledBox, TaskOutput, TextRegion};
pub use self::medicine::{MedicineDetector, MedicineReading};
pub use self::ollama::{ChatMessage, ChatPrompt, ChatResponse, MedicineInfo, OllamaChat};
pub use self::segment::{BoxMaskGenerator, MaskGenerator, MaskGeneratorWrapper, SamMaskClient};

/// 按地址方案选择的帧分析模型
pub enum AnalyzerWrapper {
  Chat(OllamaChat),
  Caption(CaptionModel),
  Florence(FlorenceText),
  Medicine(MedicineDetector),
}

impl FromUrl for AnalyzerWrapper {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    match url.scheme() {
      OllamaChat::SCHEME => Ok(AnalyzerWrapper::Chat(OllamaChat::from_url(url)?)),
      CaptionModel::SCHEME => Ok(AnalyzerWrapper::Caption(CaptionModel::from_url(url)?)),
      FlorenceModel::SCHEME => {
        let task = url
          .query_pairs()
          .find(|(k, _)| k == "task")
          .map(|(_, v)| v.into_owned())
          .unwrap_or_else(|| "ocr".to_string());
        let model = FlorenceModel::from_url(url)?;
        match task.as_str() {
          "medicine" => Ok(AnalyzerWrapper::Medicine(MedicineDetector::new(model))),
          "ocr" => Ok(AnalyzerWrapper::Florence(FlorenceText::new(model, FlorenceTask::Ocr))),
          "caption" => Ok(AnalyzerWrapper::Florence(FlorenceText::new(
            model,
            FlorenceTask::Caption,
          ))),
          other => Err(ModelError::ModelPathError(format!("未知的任务: {}", other))),
        }
      }
      _ => Err(ModelError::SchemeMismatch),
    }
  }
}

impl Model for AnalyzerWrapper {
  type Input = RgbImage;
  type Output = Caption;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let caption = match self {
      AnalyzerWrapper::Chat(model) => Caption::Chat(model.infer(input)?),
      AnalyzerWrapper::Caption(model) => Caption::Text(model.infer(input)?),
      AnalyzerWrapper::Florence(model) => Caption::Text(model.infer(input)?),
      AnalyzerWrapper::Medicine(model) => Caption::Medicine(model.infer(input)?),
    };
    debug!("分析结果: {:?}", caption);
    Ok(caption)
  }
}
