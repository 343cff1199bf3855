// 该文件是 Shijing （视镜） 项目的一部分。
// src/model/ollama.rs - 视觉对话模型
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
  model::{Endpoint, Model, ModelError, check_status, http_client, timeout_from_url},
};

const MEDICINE_PROMPT: &str = r#"You are an expert in optical character recognition and information extraction from photos of medicine packaging. The image shows a medicine package that carries its name, quantity, batch number, maximum retail price and expiry date.

Read the packaging carefully and extract:

| Field        | Description                                                        |
| ------------ | ------------------------------------------------------------------ |
| Name         | The full name of the medicine.                                     |
| Quantity     | The number of units (capsules, tablets, strips, bottles, cartons). |
| Batch Number | The batch or lot number.                                           |
| MRP          | The maximum retail price.                                          |
| Expiry Date  | The expiry date of the medicine.                                   |

Answer with a single JSON object using exactly these keys, for example:

{ "Name": "Medicine Name XYZ", "Quantity": 10, "Batch Number": "ABC1234", "MRP": 150.00, "Expiry Date": "Dec 2025" }
"#;

const TEXT_PROMPT: &str = "Extract and describe the text content from this image.";

/// 发送给对话模型的提示词
#[derive(Debug, Clone, PartialEq)]
pub enum ChatPrompt {
  /// 药品包装信息抽取，回复中的 JSON 会被解析
  Medicine,
  /// 描述图中文字
  Text,
  Custom(String),
}

impl ChatPrompt {
  fn from_query(value: Option<&str>) -> Self {
    match value {
      None | Some("medicine") => ChatPrompt::Medicine,
      Some("text") => ChatPrompt::Text,
      Some(other) => ChatPrompt::Custom(other.to_string()),
    }
  }

  fn content(&self) -> &str {
    match self {
      ChatPrompt::Medicine => MEDICINE_PROMPT,
      ChatPrompt::Text => TEXT_PROMPT,
      ChatPrompt::Custom(prompt) => prompt,
    }
  }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
  model: &'a str,
  messages: [ChatRequestMessage<'a>; 1],
  stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequestMessage<'a> {
  role: &'a str,
  content: &'a str,
  images: [String; 1],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
  pub role: String,
  pub content: String,
}

/// 药品包装上的字段，值保留模型给出的原始 JSON 类型
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MedicineInfo {
  #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
  pub name: Option<Value>,
  #[serde(rename = "Quantity", default, skip_serializing_if = "Option::is_none")]
  pub quantity: Option<Value>,
  #[serde(rename = "Batch Number", default, skip_serializing_if = "Option::is_none")]
  pub batch_number: Option<Value>,
  #[serde(rename = "MRP", default, skip_serializing_if = "Option::is_none")]
  pub mrp: Option<Value>,
  #[serde(rename = "Expiry Date", default, skip_serializing_if = "Option::is_none")]
  pub expiry_date: Option<Value>,
}

impl MedicineInfo {
  fn is_empty(&self) -> bool {
    self.name.is_none()
      && self.quantity.is_none()
      && self.batch_number.is_none()
      && self.mrp.is_none()
      && self.expiry_date.is_none()
  }

  /// 从模型回复中找出第一个 `{` 到最后一个 `}` 之间的 JSON 对象
  pub fn parse_reply(content: &str) -> Option<Self> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
      return None;
    }
    serde_json::from_str::<MedicineInfo>(&content[start..=end])
      .ok()
      .filter(|info| !info.is_empty())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
  pub model: String,
  pub message: ChatMessage,
  #[serde(default)]
  pub done: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub extracted: Option<MedicineInfo>,
}

/// 通过 Ollama `/api/chat` 调用的视觉对话模型
///
/// 地址形如 `ollama://127.0.0.1:11434/llama3.2-vision:11b?prompt=medicine&timeout=300`。
pub struct OllamaChat {
  endpoint: Endpoint,
  client: reqwest::blocking::Client,
  model: String,
  prompt: ChatPrompt,
}

impl FromUrlWithScheme for OllamaChat {
  const SCHEME: &'static str = "ollama";
}

impl FromUrl for OllamaChat {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let model = crate::url_file_path(url).trim_matches('/').to_string();
    if model.is_empty() {
      return Err(ModelError::ModelPathError(format!("地址中缺少模型名: {}", url)));
    }
    let prompt = ChatPrompt::from_query(
      url
        .query_pairs()
        .find(|(k, _)| k == "prompt")
        .map(|(_, v)| v.into_owned())
        .as_deref(),
    );
    let timeout = timeout_from_url(url);
    let endpoint = Endpoint::from_model_url(url, false)?;
    info!(
      "对话模型 {} @ {}, 超时 {:?}",
      model,
      endpoint.as_str(),
      timeout
    );

    Ok(OllamaChat {
      endpoint,
      client: http_client(timeout)?,
      model,
      prompt,
    })
  }
}

impl OllamaChat {
  pub fn model_name(&self) -> &str {
    &self.model
  }

  pub fn prompt(&self) -> &ChatPrompt {
    &self.prompt
  }
}

impl Model for OllamaChat {
  type Input = RgbImage;
  type Output = ChatResponse;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let image = encode_jpeg_base64(input)?;
    debug!("图像编码完成, base64 长度 {}", image.len());

    let request = ChatRequest {
      model: &self.model,
      messages: [ChatRequestMessage {
        role: "user",
        content: self.prompt.content(),
        images: [image],
      }],
      stream: false,
    };

    let response = self
      .client
      .post(self.endpoint.join("/api/chat"))
      .json(&request)
      .send()?;
    let mut reply: ChatResponse = check_status(response)?.json()?;
    debug!("对话模型回复: {}", reply.message.content);

    if self.prompt == ChatPrompt::Medicine {
      reply.extracted = MedicineInfo::parse_reply(&reply.message.content);
    }

    Ok(reply)
  }
}
