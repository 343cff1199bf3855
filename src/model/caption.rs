// 该文件是 Shijing （视镜） 项目的一部分。
// src/model/caption.rs - 图像描述模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::RgbImage;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::encode_jpeg,
  model::{Endpoint, Model, ModelError, check_status, http_client, timeout_from_url},
};

#[derive(Debug, Deserialize)]
struct GeneratedText {
  generated_text: String,
}

/// 图像描述模型（如 BLIP），按 image-to-text 推理接口调用
///
/// 地址形如 `caption://host:port/models/Salesforce/blip-image-captioning-base?token=...`，
/// 请求体为 JPEG 字节，响应为 `[{"generated_text": "..."}]`。
pub struct CaptionModel {
  endpoint: Endpoint,
  client: reqwest::blocking::Client,
  token: Option<String>,
}

impl FromUrlWithScheme for CaptionModel {
  const SCHEME: &'static str = "caption";
}

impl FromUrl for CaptionModel {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let token = url
      .query_pairs()
      .find(|(k, _)| k == "token")
      .map(|(_, v)| v.into_owned());
    let endpoint = Endpoint::from_model_url(url, true)?;
    info!("描述模型 @ {}", endpoint.as_str());

    Ok(CaptionModel {
      endpoint,
      client: http_client(timeout_from_url(url))?,
      token,
    })
  }
}

/// 取第一条生成结果并去掉首尾空白
fn first_caption(items: Vec<GeneratedText>) -> Result<String, ModelError> {
  items
    .into_iter()
    .next()
    .map(|item| item.generated_text.trim().to_string())
    .ok_or_else(|| ModelError::UnexpectedOutput("描述模型没有返回结果".to_string()))
}

impl Model for CaptionModel {
  type Input = RgbImage;
  type Output = String;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let body = encode_jpeg(input)?;
    debug!("发送 {} 字节 JPEG 到描述模型", body.len());

    let mut request = self
      .client
      .post(self.endpoint.join(""))
      .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
      .body(body);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let items: Vec<GeneratedText> = check_status(request.send()?)?.json()?;
    first_caption(items)
  }
}
