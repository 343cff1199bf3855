// 该文件是 Shijing （视镜） 项目的一部分。
// src/server.rs - HTTP 服务
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

use std::{
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use axum::{
  Json, Router,
  extract::{DefaultBodyLimit, Multipart, Path as UrlPath, Query, State, multipart::MultipartError},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::{
  FromUrl,
  input::{
    FrameSource, InputError, InputWrapper, VIDEO_INPUT_SUPPORTED, image_file_url, video_file_url,
  },
  model::FrameAnalyzer,
  output::NullOutput,
  record::FrameRecord,
  sampler::{SamplePolicy, SamplerError, sample},
  task::{AnalyzeTask, Task, TaskError},
};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;
const BYTES_PER_MIB: usize = 1024 * 1024;
const UPLOAD_FIELD: &str = "file";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("{0}")]
  BadRequest(String),
  #[error("{0}")]
  PayloadTooLarge(String),
  #[error("内部错误: {0}")]
  Internal(String),
}

impl ApiError {
  fn classify(message: String, client: bool) -> Self {
    if client {
      ApiError::BadRequest(message)
    } else {
      ApiError::Internal(message)
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, detail) = match self {
      ApiError::BadRequest(message) => {
        warn!("请求无效: {}", message);
        (StatusCode::BAD_REQUEST, message)
      }
      ApiError::PayloadTooLarge(message) => {
        warn!("上传过大: {}", message);
        (StatusCode::PAYLOAD_TOO_LARGE, message)
      }
      ApiError::Internal(cause) => {
        error!("处理请求时出错: {}", cause);
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          "Internal server error".to_string(),
        )
      }
    };
    (status, Json(json!({ "detail": detail }))).into_response()
  }
}

impl From<MultipartError> for ApiError {
  fn from(e: MultipartError) -> Self {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
      ApiError::PayloadTooLarge(e.body_text())
    } else {
      ApiError::BadRequest(format!("无法读取上传内容: {}", e.body_text()))
    }
  }
}

impl From<InputError> for ApiError {
  fn from(e: InputError) -> Self {
    let client = e.is_client_error();
    ApiError::classify(format!("无法打开视频: {}", e), client)
  }
}

impl From<SamplerError> for ApiError {
  fn from(e: SamplerError) -> Self {
    let client = e.is_client_error();
    ApiError::classify(e.to_string(), client)
  }
}

impl From<TaskError> for ApiError {
  fn from(e: TaskError) -> Self {
    let client = e.is_client_error();
    ApiError::classify(e.to_string(), client)
  }
}

impl From<std::io::Error> for ApiError {
  fn from(e: std::io::Error) -> Self {
    ApiError::Internal(format!("I/O 错误: {}", e))
  }
}

impl From<tokio::task::JoinError> for ApiError {
  fn from(e: tokio::task::JoinError) -> Self {
    ApiError::Internal(format!("分析线程异常退出: {}", e))
  }
}

/// 把以 MiB 为单位的上传上限换算为字节，溢出时返回 `None`
pub fn upload_limit_from_mib(mib: usize) -> Option<usize> {
  mib.checked_mul(BYTES_PER_MIB)
}

/// 所有请求共享的只读状态
#[derive(Clone)]
pub struct AppState {
  analyzer: Arc<dyn FrameAnalyzer>,
  policy: SamplePolicy,
  upload_dir: PathBuf,
}

impl AppState {
  pub fn new(analyzer: Arc<dyn FrameAnalyzer>, policy: SamplePolicy, upload_dir: PathBuf) -> Self {
    Self {
      analyzer,
      policy,
      upload_dir,
    }
  }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
  Router::new()
    .route("/", get(root))
    .route("/items/{item_id}", get(read_item))
    .route("/api/analyze-image", post(analyze_image))
    .route("/api/authenticate-product", post(authenticate_product))
    .route("/api/authenticate", post(authenticate))
    .with_state(state)
    .layer(DefaultBodyLimit::max(max_upload_bytes))
    .layer(CorsLayer::permissive())
}

async fn root() -> Json<Value> {
  Json(json!({ "Hello": "World" }))
}

#[derive(Debug, Deserialize)]
struct ItemQuery {
  q: Option<String>,
}

async fn read_item(UrlPath(item_id): UrlPath<i64>, Query(query): Query<ItemQuery>) -> Json<Value> {
  Json(json!({ "item_id": item_id, "q": query.q }))
}

async fn analyze_image(mut multipart: Multipart) -> Result<Json<Value>, ApiError> {
  while let Some(field) = multipart.next_field().await? {
    let name = field.name().unwrap_or_default().to_string();
    let bytes = field.bytes().await?;
    debug!("忽略上传字段 {} ({} 字节)", name, bytes.len());
  }
  Ok(Json(Value::Null))
}

async fn authenticate_product(Json(product): Json<serde_json::Map<String, Value>>) -> Json<Value> {
  debug!("忽略产品信息: {} 个字段", product.len());
  Json(Value::Null)
}

static UPLOAD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 上传的临时文件，离开作用域时删除
struct TempUpload {
  path: PathBuf,
}

impl TempUpload {
  fn new(dir: &Path, file_name: Option<&str>) -> Self {
    let extension = file_name
      .and_then(|name| Path::new(name).extension())
      .and_then(|ext| ext.to_str())
      .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
      .map(|ext| ext.to_ascii_lowercase())
      .unwrap_or_else(|| "bin".to_string());
    let id = UPLOAD_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(
      "upload-{}-{}-{}.{}",
      Utc::now().format("%Y%m%d%H%M%S%3f"),
      std::process::id(),
      id,
      extension
    ));
    Self { path }
  }

  fn path(&self) -> &Path {
    &self.path
  }

  fn is_image(&self) -> bool {
    self
      .path
      .extension()
      .and_then(|ext| ext.to_str())
      .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
  }
}

impl Drop for TempUpload {
  fn drop(&mut self) {
    match std::fs::remove_file(&self.path) {
      Ok(()) => debug!("删除临时文件 {}", self.path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!("无法删除临时文件 {}: {}", self.path.display(), e),
    }
  }
}

/// 把 `file` 字段写到临时文件
async fn save_upload(dir: &Path, multipart: &mut Multipart) -> Result<TempUpload, ApiError> {
  while let Some(mut field) = multipart.next_field().await? {
    if field.name() != Some(UPLOAD_FIELD) {
      continue;
    }

    tokio::fs::create_dir_all(dir).await?;
    let upload = TempUpload::new(dir, field.file_name());
    let mut file = tokio::fs::File::create(upload.path()).await?;
    let mut size = 0usize;
    while let Some(chunk) = field.chunk().await? {
      size += chunk.len();
      file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if size == 0 {
      return Err(ApiError::BadRequest("上传的文件为空".to_string()));
    }
    info!("收到上传 {} ({} 字节)", upload.path().display(), size);
    return Ok(upload);
  }
  Err(ApiError::BadRequest(format!("缺少 {} 字段", UPLOAD_FIELD)))
}

/// 抽帧并逐帧分析，图片按单帧视频处理
fn analyze_upload(
  upload: &TempUpload,
  analyzer: &dyn FrameAnalyzer,
  policy: SamplePolicy,
) -> Result<Vec<FrameRecord>, ApiError> {
  let (url, policy) = if upload.is_image() {
    (image_file_url(upload.path()), SamplePolicy::All)
  } else if VIDEO_INPUT_SUPPORTED {
    (video_file_url(upload.path()), policy)
  } else {
    return Err(ApiError::BadRequest(
      "服务未启用视频解码，只接受 jpg/jpeg/png 图片".to_string(),
    ));
  };
  let url = url.map_err(|e| ApiError::Internal(format!("无法构造输入地址: {}", e)))?;

  let input = InputWrapper::from_url(&url)?;
  let meta = input.meta();
  info!(
    "视频 {}x{}, 帧率 {:?}, 时长 {:?}",
    meta.width, meta.height, meta.fps, meta.duration
  );
  let sampled = sample(input, &meta, policy)?;
  let records = AnalyzeTask.run_task(sampled, analyzer, NullOutput)?;
  Ok(records)
}

async fn authenticate(
  State(state): State<AppState>,
  mut multipart: Multipart,
) -> Result<Json<Vec<FrameRecord>>, ApiError> {
  let upload = save_upload(&state.upload_dir, &mut multipart).await?;
  let analyzer = state.analyzer.clone();
  let policy = state.policy;

  let records = tokio::task::spawn_blocking(move || {
    let records = analyze_upload(&upload, analyzer.as_ref(), policy);
    drop(upload);
    records
  })
  .await??;

  Ok(Json(records))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Caption, ModelError};
  use axum::{body::Body, http::Request};
  use http_body_util::BodyExt;
  use image::RgbImage;
  use tower::ServiceExt;

  const BOUNDARY: &str = "shijing-test-boundary";

  struct StubAnalyzer;

  impl FrameAnalyzer for StubAnalyzer {
    fn analyze(&self, image: &RgbImage) -> Result<Caption, ModelError> {
      Ok(Caption::Text(format!("{}x{}", image.width(), image.height())))
    }
  }

  fn test_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("shijing-server-{}-{}", name, std::process::id()))
  }

  fn app(upload_dir: &Path, limit: usize) -> Router {
    let state = AppState::new(Arc::new(StubAnalyzer), SamplePolicy::default(), upload_dir.to_path_buf());
    router(state, limit)
  }

  fn multipart_request(uri: &str, field: &str, file_name: &str, content: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
      format!(
        "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        BOUNDARY, field, file_name
      )
      .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
      .method("POST")
      .uri(uri)
      .header(
        "content-type",
        format!("multipart/form-data; boundary={}", BOUNDARY),
      )
      .body(Body::from(body))
      .unwrap()
  }

  async fn json_body(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
  }

  fn png_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(12, 8, image::Rgb([30, 60, 90]));
    let mut bytes = Vec::new();
    image
      .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
      .unwrap();
    bytes
  }

  #[tokio::test]
  async fn test_root() {
    let dir = test_dir("root");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"Hello": "World"}));
  }

  #[tokio::test]
  async fn test_read_item() {
    let dir = test_dir("items");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(Request::builder().uri("/items/5?q=abc").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(json_body(response).await, json!({"item_id": 5, "q": "abc"}));

    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(Request::builder().uri("/items/7").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(json_body(response).await, json!({"item_id": 7, "q": null}));
  }

  #[tokio::test]
  async fn test_stub_routes_return_null() {
    let dir = test_dir("stubs");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(multipart_request("/api/analyze-image", "image", "a.png", b"data"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, Value::Null);

    let request = Request::builder()
      .method("POST")
      .uri("/api/authenticate-product")
      .header("content-type", "application/json")
      .body(Body::from(r#"{"name": "DOLO 650", "batch": "A1"}"#))
      .unwrap();
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, Value::Null);
  }

  #[tokio::test]
  async fn test_authenticate_image_upload() {
    let dir = test_dir("authenticate");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(multipart_request("/api/authenticate", "file", "frame.PNG", &png_bytes()))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["frame_number"], json!(1));
    assert_eq!(records[0]["caption"], json!("12x8"));
    assert!(!records[0]["frame_image"].as_str().unwrap().is_empty());

    // 临时文件已删除
    let leftover = std::fs::read_dir(&dir).unwrap().count();
    assert_eq!(leftover, 0);
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[tokio::test]
  async fn test_authenticate_without_file_field() {
    let dir = test_dir("missing-field");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(multipart_request("/api/authenticate", "video", "clip.mp4", b"data"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["detail"].as_str().unwrap().contains("file"));
  }

  #[tokio::test]
  async fn test_authenticate_corrupt_upload() {
    let dir = test_dir("corrupt");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(multipart_request("/api/authenticate", "file", "frame.png", b"not an image"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["detail"].is_string());
    let leftover = std::fs::read_dir(&dir).unwrap().count();
    assert_eq!(leftover, 0);
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[cfg(not(feature = "gstreamer_input"))]
  #[tokio::test]
  async fn test_video_upload_without_decoder_is_rejected() {
    let dir = test_dir("no-decoder");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(multipart_request("/api/authenticate", "file", "clip.mp4", b"\x00\x00\x00\x18ftypmp42"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["detail"].as_str().unwrap().contains("jpg"));
    let leftover = std::fs::read_dir(&dir).unwrap().count();
    assert_eq!(leftover, 0);
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[cfg(feature = "gstreamer_input")]
  #[tokio::test]
  async fn test_corrupt_video_upload_is_bad_request() {
    let dir = test_dir("corrupt-video");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(multipart_request("/api/authenticate", "file", "clip.mp4", b"not a video at all"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["detail"].is_string());
    let leftover = std::fs::read_dir(&dir).unwrap().count();
    assert_eq!(leftover, 0);
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn test_upload_limit_from_mib() {
    assert_eq!(upload_limit_from_mib(256), Some(DEFAULT_MAX_UPLOAD_BYTES));
    assert_eq!(upload_limit_from_mib(0), Some(0));
    assert_eq!(upload_limit_from_mib(usize::MAX), None);
  }

  #[tokio::test]
  async fn test_authenticate_empty_upload() {
    let dir = test_dir("empty");
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES)
      .oneshot(multipart_request("/api/authenticate", "file", "clip.mp4", b""))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[tokio::test]
  async fn test_upload_limit() {
    let dir = test_dir("limit");
    let response = app(&dir, 64)
      .oneshot(multipart_request("/api/authenticate", "file", "frame.png", &[0u8; 4096]))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[tokio::test]
  async fn test_cors_allows_any_origin() {
    let dir = test_dir("cors");
    let request = Request::builder()
      .uri("/")
      .header("origin", "http://scanner.local")
      .body(Body::empty())
      .unwrap();
    let response = app(&dir, DEFAULT_MAX_UPLOAD_BYTES).oneshot(request).await.unwrap();
    assert_eq!(
      response.headers().get("access-control-allow-origin").unwrap(),
      "*"
    );
  }

  #[test]
  fn test_internal_error_hides_cause() {
    let response = ApiError::Internal("secret".to_string()).into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
  }

  #[test]
  fn test_temp_upload_extension() {
    let dir = Path::new("/tmp");
    assert!(TempUpload::new(dir, Some("a.JPG")).is_image());
    assert!(!TempUpload::new(dir, Some("clip.mp4")).is_image());
    assert!(TempUpload::new(dir, Some("../../etc/passwd")).path().starts_with(dir));
    assert!(TempUpload::new(dir, None).path().to_string_lossy().ends_with(".bin"));
  }
}
