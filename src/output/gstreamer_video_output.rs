// 该文件是 Shijing （视镜） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频文件输出模块
//!
//! 将处理后的帧编码为视频文件。管道在收到第一帧时按帧尺寸创建，
//! 之后的帧必须与第一帧尺寸一致。
//!
//! ## URL Scheme
//!
//! `gst:///output.mp4?fps=30`
//!
//! 按扩展名选择容器: `.mp4`、`.mkv`、`.avi` 使用 H.264，`.webm` 使用 VP8，
//! 其余按 MP4 处理。

use std::sync::Mutex;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::VideoFrame,
  output::{Annotated, Render},
  url_file_path,
};

const DEFAULT_FPS: i32 = 30;
const EOS_TIMEOUT_SECONDS: u64 = 10;

/// GStreamer 视频输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("Buffer creation error")]
  BufferCreationError,
  #[error("帧尺寸 {got:?} 与视频尺寸 {expected:?} 不一致")]
  FrameSizeMismatch { expected: (u32, u32), got: (u32, u32) },
}

struct Encoder {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  width: u32,
  height: u32,
  frame_count: u64,
}

fn pipeline_description(file_path: &str) -> String {
  let encoder = if file_path.ends_with(".webm") {
    "vp8enc ! webmmux"
  } else if file_path.ends_with(".mkv") {
    "video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux"
  } else if file_path.ends_with(".avi") {
    "video/x-raw,format=I420 ! x264enc ! avimux"
  } else {
    "video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! mp4mux"
  };
  format!(
    "appsrc name=src ! videoconvert ! {} ! filesink location=\"{}\"",
    encoder,
    file_path.replace('"', "\\\"")
  )
}

/// GStreamer 视频文件输出
pub struct GStreamerVideoOutput {
  file_path: String,
  fps: i32,
  encoder: Mutex<Option<Encoder>>,
}

impl FromUrlWithScheme for GStreamerVideoOutput {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(GStreamerVideoOutputError::SchemeMismatch);
    }

    gst::init()?;

    let fps = url
      .query_pairs()
      .find(|(k, _)| k == "fps")
      .and_then(|(_, v)| v.parse::<i32>().ok())
      .filter(|fps| *fps > 0)
      .unwrap_or(DEFAULT_FPS);

    Ok(GStreamerVideoOutput {
      file_path: url_file_path(url),
      fps,
      encoder: Mutex::new(None),
    })
  }
}

impl GStreamerVideoOutput {
  fn start(&self, width: u32, height: u32) -> Result<Encoder, GStreamerVideoOutputError> {
    let pipeline_desc = pipeline_description(&self.file_path);
    info!("创建视频输出管道: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new(self.fps, 1))
      .build();
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;
    info!(
      "视频输出已启动: {}x{} @ {} fps -> {}",
      width, height, self.fps, self.file_path
    );

    Ok(Encoder {
      pipeline,
      appsrc,
      width,
      height,
      frame_count: 0,
    })
  }

  fn push_frame(&self, image: &image::RgbImage) -> Result<(), GStreamerVideoOutputError> {
    let mut guard = self
      .encoder
      .lock()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("编码器锁已损坏".to_string()))?;
    if guard.is_none() {
      *guard = Some(self.start(image.width(), image.height())?);
    }
    let Some(encoder) = guard.as_mut() else {
      return Err(GStreamerVideoOutputError::PipelineError("编码器未启动".to_string()));
    };

    if image.dimensions() != (encoder.width, encoder.height) {
      return Err(GStreamerVideoOutputError::FrameSizeMismatch {
        expected: (encoder.width, encoder.height),
        got: image.dimensions(),
      });
    }

    let data = image.as_raw();
    let mut buffer =
      gst::Buffer::with_size(data.len()).map_err(|_| GStreamerVideoOutputError::BufferCreationError)?;
    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerVideoOutputError::BufferCreationError)?;
      let frame_ns = 1_000_000_000 / self.fps as u64;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(encoder.frame_count * frame_ns));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_ns));
      let mut buffer_map = buffer_ref
        .map_writable()
        .map_err(|_| GStreamerVideoOutputError::PipelineError("无法映射缓冲区".to_string()))?;
      buffer_map.copy_from_slice(data);
    }
    encoder.frame_count += 1;

    encoder.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("推送缓冲区失败: {:?}", e))
    })?;

    Ok(())
  }
}

/// 检查等待 EOS 时从总线取到的消息，只有收到 EOS 才算写完
fn eos_finished(message: Option<&gst::Message>, file_path: &str) -> bool {
  let Some(message) = message else {
    error!(
      "等待 EOS 超时 ({} 秒): {}",
      EOS_TIMEOUT_SECONDS, file_path
    );
    return false;
  };
  match message.view() {
    gst::MessageView::Eos(..) => true,
    gst::MessageView::Error(err) => {
      error!(
        "写入视频 {} 时出错: {} (来源: {:?}, 调试信息: {:?})",
        file_path,
        err.error(),
        err.src().map(|s| s.path_string()),
        err.debug()
      );
      false
    }
    _ => false,
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    let encoder = match self.encoder.get_mut() {
      Ok(encoder) => encoder.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    let Some(encoder) = encoder else {
      warn!("视频输出没有收到任何帧: {}", self.file_path);
      return;
    };

    // 发送 EOS 并等待写完文件尾
    let mut finalized = false;
    if let Err(e) = encoder.appsrc.end_of_stream() {
      error!("无法发送 EOS: {:?}", e);
    } else if let Some(bus) = encoder.pipeline.bus() {
      let message = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(EOS_TIMEOUT_SECONDS),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
      finalized = eos_finished(message.as_ref(), &self.file_path);
    }

    if let Err(e) = encoder.pipeline.set_state(gst::State::Null) {
      warn!("无法停止视频输出管道: {}", e);
    }
    if finalized {
      info!(
        "视频输出已关闭，共写入 {} 帧: {}",
        encoder.frame_count, self.file_path
      );
    } else {
      error!(
        "视频输出未正常结束，文件可能无法播放 ({} 帧): {}",
        encoder.frame_count, self.file_path
      );
    }
  }
}

impl<T: Annotated> Render<VideoFrame, T> for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn render_result(&self, frame: &VideoFrame, result: &T) -> Result<(), Self::Error> {
    self.push_frame(result.output_image(frame))
  }
}
