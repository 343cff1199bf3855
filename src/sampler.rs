// 该文件是 Shijing （视镜） 项目的一部分。
// src/sampler.rs - 视频抽帧策略
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

use std::{fmt, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::debug;

use crate::{
  frame::VideoFrame,
  input::{InputError, VideoMeta},
};

#[derive(Error, Debug)]
pub enum SamplerError {
  #[error("视频中没有可读取的帧")]
  NoFrames,
  #[error("视频时长为零")]
  ZeroDuration,
  #[error("帧率无效: {0:?}")]
  InvalidFrameRate(Option<f64>),
  #[error("无法解析抽帧策略: {0}")]
  InvalidPolicy(String),
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
}

impl SamplerError {
  /// 是否由上传的内容本身导致
  pub fn is_client_error(&self) -> bool {
    match self {
      SamplerError::NoFrames | SamplerError::ZeroDuration | SamplerError::InvalidFrameRate(_) => {
        true
      }
      SamplerError::InvalidPolicy(_) => false,
      SamplerError::Input(e) => e.is_client_error(),
    }
  }
}

/// 抽帧策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplePolicy {
  /// 每隔若干秒取一帧
  Every { seconds: f64 },
  /// 只取第一帧和最后一帧
  FirstAndLast,
  /// 逐帧处理
  All,
}

impl Default for SamplePolicy {
  fn default() -> Self {
    SamplePolicy::Every { seconds: 2.0 }
  }
}

impl FromStr for SamplePolicy {
  type Err = SamplerError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "first-last" => Ok(SamplePolicy::FirstAndLast),
      "all" => Ok(SamplePolicy::All),
      _ => {
        let seconds = s
          .strip_prefix("every:")
          .and_then(|v| v.parse::<f64>().ok())
          .filter(|v| v.is_finite() && *v > 0.0)
          .ok_or_else(|| SamplerError::InvalidPolicy(s.to_string()))?;
        Ok(SamplePolicy::Every { seconds })
      }
    }
  }
}

impl fmt::Display for SamplePolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SamplePolicy::Every { seconds } => write!(f, "every:{}", seconds),
      SamplePolicy::FirstAndLast => write!(f, "first-last"),
      SamplePolicy::All => write!(f, "all"),
    }
  }
}

impl SamplePolicy {
  /// 校验视频元数据是否满足该策略
  pub fn check(&self, meta: &VideoMeta) -> Result<(), SamplerError> {
    if meta.duration == Some(Duration::ZERO) {
      return Err(SamplerError::ZeroDuration);
    }
    if let SamplePolicy::Every { .. } = self
      && !meta.fps.is_some_and(|fps| fps.is_finite() && fps > 0.0)
    {
      return Err(SamplerError::InvalidFrameRate(meta.fps));
    }
    Ok(())
  }

  /// 每隔多少帧取一帧，至少为 1
  fn step(&self, fps: Option<f64>) -> u64 {
    match (self, fps) {
      (SamplePolicy::Every { seconds }, Some(fps)) => ((fps * seconds) as u64).max(1),
      _ => 1,
    }
  }
}

/// 被选中的帧
#[derive(Debug, Clone)]
pub struct SampledFrame {
  /// 从 1 开始的解码计数
  pub frame_number: u64,
  /// 秒
  pub timestamp: f64,
  pub frame: VideoFrame,
}

/// 按策略过滤帧的迭代器
pub struct Sampled<I> {
  inner: I,
  policy: SamplePolicy,
  fps: Option<f64>,
  step: u64,
  seen: u64,
  last: Option<VideoFrame>,
  finished: bool,
}

/// 校验元数据并返回抽帧迭代器
pub fn sample<I>(frames: I, meta: &VideoMeta, policy: SamplePolicy) -> Result<Sampled<I>, SamplerError>
where
  I: Iterator<Item = Result<VideoFrame, InputError>>,
{
  policy.check(meta)?;
  let step = policy.step(meta.fps);
  debug!("抽帧策略: {}, 步长: {} 帧", policy, step);
  Ok(Sampled {
    inner: frames,
    policy,
    fps: meta.fps.filter(|fps| *fps > 0.0),
    step,
    seen: 0,
    last: None,
    finished: false,
  })
}

impl<I> Sampled<I> {
  fn wrap(&self, frame: VideoFrame) -> SampledFrame {
    let frame_number = frame.index + 1;
    let timestamp = match self.fps {
      Some(fps) => frame_number as f64 / fps,
      None => frame.timestamp_ms as f64 / 1000.0,
    };
    SampledFrame {
      frame_number,
      timestamp,
      frame,
    }
  }
}

impl<I> Iterator for Sampled<I>
where
  I: Iterator<Item = Result<VideoFrame, InputError>>,
{
  type Item = Result<SampledFrame, SamplerError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    loop {
      match self.inner.next() {
        Some(Err(e)) => {
          self.finished = true;
          return Some(Err(e.into()));
        }
        Some(Ok(frame)) => {
          self.seen += 1;
          match self.policy {
            SamplePolicy::All => return Some(Ok(self.wrap(frame))),
            SamplePolicy::Every { .. } => {
              if (frame.index + 1) % self.step == 0 {
                return Some(Ok(self.wrap(frame)));
              }
            }
            SamplePolicy::FirstAndLast => {
              if self.seen == 1 {
                return Some(Ok(self.wrap(frame)));
              }
              self.last = Some(frame);
            }
          }
        }
        None => {
          self.finished = true;
          if self.seen == 0 {
            return Some(Err(SamplerError::NoFrames));
          }
          return self.last.take().map(|frame| Ok(self.wrap(frame)));
        }
      }
    }
  }
}
