// 该文件是 Shijing （视镜） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入模块
//!
//! 使用 GStreamer 解码视频文件，逐帧输出 RGB 图像。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use shijing::{FromUrl, input::GStreamerInputPipelineBuilder};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://file/data/clip.mp4?rotate=90")?;
//! let input = GStreamerInputPipelineBuilder::from_url(&url)?.build()?;
//! for frame in input {
//!     let frame = frame?;
//!     println!("帧 {}: {}x{}", frame.index, frame.width(), frame.height());
//! }
//! # Ok(())
//! # }
//! ```

use std::{collections::HashMap, time::Duration};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::VideoFrame,
  input::{InputError, VideoMeta},
  url_file_path,
};

const PREROLL_TIMEOUT_SECONDS: u64 = 10;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://file/..."）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// 文件不存在或不可读
  #[error("Cannot open video file: {0}")]
  OpenError(String),
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 播放过程中解码失败
  #[error("Decode error: {0}")]
  DecodeError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 状态改变错误（通常是文件无法解码）
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

impl GStreamerInputError {
  pub fn is_client_error(&self) -> bool {
    matches!(
      self,
      GStreamerInputError::OpenError(_)
        | GStreamerInputError::DecodeError(_)
        | GStreamerInputError::StateChangeError(_)
        | GStreamerInputError::VideoInfoError
        | GStreamerInputError::UnsupportedFormat
        | GStreamerInputError::BufferSizeMismatch { .. }
    )
  }
}

pub enum GStreamerInputBuilderItem {
  FileSource(String),
  TargetFormat { format: String },
  VideoFlip { method: u32, direction: u32 },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path.replace('"', "\\\""))
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::VideoFlip { method, direction } => {
        format!("videoflip method={} video-direction={}", method, direction)
      }
    }
  }
}

/// GStreamer 输入管道构建器
///
/// 地址形如 `gst://file/<path>?rotate=90`。
pub struct GStreamerInputPipelineBuilder {
  path: String,
  items: Vec<GStreamerInputBuilderItem>,
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl GStreamerInputPipelineBuilder {
  pub fn file(path: &str) -> Self {
    GStreamerInputPipelineBuilder {
      path: path.to_string(),
      items: vec![
        GStreamerInputBuilderItem::FileSource(path.to_string()),
        GStreamerInputBuilderItem::TargetFormat {
          format: "RGB".to_string(),
        },
      ],
    }
  }

  fn video_flip(rotate: Option<&str>) -> Option<GStreamerInputBuilderItem> {
    let (method, direction) = match rotate? {
      "90" => (1, 1),
      "180" => (2, 2),
      "270" => (3, 3),
      _ => return None,
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method, direction })
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    if !std::path::Path::new(&self.path).is_file() {
      return Err(GStreamerInputError::OpenError(self.path));
    }

    gst::init()?;

    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    // 文件输入不能丢帧，也不需要按时钟同步
    let full_pipeline = format!(
      "{} ! appsink name=sink sync=false max-buffers=4 drop=false",
      basic_pipeline
    );

    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    let mut input = GStreamerInput {
      pipeline,
      appsink,
      meta: VideoMeta {
        width: 0,
        height: 0,
        fps: None,
        duration: None,
      },
      frame_index: 0,
      finished: false,
    };

    // 先进入 PAUSED 完成预卷，以便读取时长和帧率
    input.pipeline.set_state(gst::State::Paused)?;
    let (result, _, _) = input
      .pipeline
      .state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECONDS));
    result?;

    input.meta.duration = input
      .pipeline
      .query_duration::<gst::ClockTime>()
      .map(|d| Duration::from_nanos(d.nseconds()));

    match input.appsink.pull_preroll() {
      Ok(sample) => {
        let caps = sample.caps().ok_or(GStreamerInputError::VideoInfoError)?;
        let info =
          gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
        let fps = info.fps();
        input.meta.width = info.width();
        input.meta.height = info.height();
        input.meta.fps = (fps.denom() != 0 && fps.numer() > 0)
          .then(|| fps.numer() as f64 / fps.denom() as f64);
      }
      Err(e) => {
        // 没有任何帧时预卷不会产生样本，交给抽帧器报告
        warn!("预卷未得到视频帧: {}", e);
      }
    }

    info!(
      "视频信息: {}x{}, 帧率 {:?}, 时长 {:?}",
      input.meta.width, input.meta.height, input.meta.fps, input.meta.duration
    );

    input.pipeline.set_state(gst::State::Playing)?;

    Ok(input)
  }
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME || url.host_str() != Some("file") {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = Self::file(&url_file_path(url));
    if let Some(video_flip) = Self::video_flip(query.get("rotate").map(|s| s.as_ref())) {
      builder.items.push(video_flip);
      // 旋转后重新转换为 RGB
      builder.items.push(GStreamerInputBuilderItem::TargetFormat {
        format: "RGB".to_string(),
      });
    }

    Ok(builder)
  }
}

/// GStreamer 视频输入
///
/// 管理 GStreamer 管道和 appsink，按解码顺序输出帧。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  meta: VideoMeta,
  frame_index: u64,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn meta(&self) -> VideoMeta {
    self.meta
  }

  /// 取下一帧，EOS 时返回 `None`，管道出错时返回总线上的错误
  fn pull_sample(&self) -> Result<Option<gst::Sample>, GStreamerInputError> {
    match self.appsink.pull_sample() {
      Ok(sample) => Ok(Some(sample)),
      Err(_) if self.appsink.is_eos() => Ok(None),
      Err(_) => {
        let error = self
          .pipeline
          .bus()
          .and_then(|bus| bus_error(&bus))
          .unwrap_or_else(|| {
            GStreamerInputError::DecodeError("视频结束前无法读取帧".to_string())
          });
        Err(error)
      }
    }
  }
}

/// 取出总线上的第一条错误消息
fn bus_error(bus: &gst::Bus) -> Option<GStreamerInputError> {
  let message = bus.pop_filtered(&[gst::MessageType::Error])?;
  match message.view() {
    gst::MessageView::Error(err) => Some(GStreamerInputError::DecodeError(format!(
      "{} (来源: {:?}, 调试信息: {:?})",
      err.error(),
      err.src().map(|s| s.path_string()),
      err.debug()
    ))),
    _ => None,
  }
}

impl Iterator for GStreamerInput {
  type Item = Result<VideoFrame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    let sample = match self.pull_sample() {
      Ok(Some(sample)) => sample,
      Ok(None) => {
        self.finished = true;
        debug!("视频结束, 共 {} 帧", self.frame_index);
        return None;
      }
      Err(e) => {
        error!("第 {} 帧解码失败: {}", self.frame_index, e);
        self.finished = true;
        return Some(Err(e.into()));
      }
    };

    let index = self.frame_index;
    self.frame_index += 1;
    match convert_sample(sample, index) {
      Ok(frame) => Some(Ok(frame)),
      Err(e) => {
        error!("Failed to convert sample {}: {}", index, e);
        self.finished = true;
        Some(Err(e.into()))
      }
    }
  }
}

fn convert_sample(sample: gst::Sample, index: u64) -> Result<VideoFrame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  // 每行可能带有对齐填充
  let expected_size = stride * (height.saturating_sub(1)) + width * 3;
  if data.len() < expected_size {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let bgr = match video_info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    _ => return Err(GStreamerInputError::UnsupportedFormat),
  };

  let mut pixels = Vec::with_capacity(width * height * 3);
  for row in 0..height {
    let row = &data[row * stride..row * stride + width * 3];
    if bgr {
      for px in row.chunks_exact(3) {
        pixels.extend_from_slice(&[px[2], px[1], px[0]]);
      }
    } else {
      pixels.extend_from_slice(row);
    }
  }

  let image = RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| GStreamerInputError::PipelineError("无法创建 RGB 图像".to_string()))?;
  let timestamp_ms = buffer.pts().map_or(0, |pts| pts.mseconds());

  Ok(VideoFrame::new(index, timestamp_ms, image))
}
