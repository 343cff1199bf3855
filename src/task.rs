// 该文件是 Shijing （视镜） 项目的一部分。
// src/task.rs - 任务循环
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
  sync::mpsc::{Receiver, channel},
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
  frame::VideoFrame,
  input::InputError,
  model::{FrameAnalyzer, Model},
  output::Render,
  record::FrameRecord,
  sampler::{SampledFrame, SamplerError},
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("抽帧错误: {0}")]
  Sampler(#[from] SamplerError),
  #[error("帧编码错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("输出错误: {0}")]
  Output(Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
  pub fn is_client_error(&self) -> bool {
    match self {
      TaskError::Sampler(e) => e.is_client_error(),
      TaskError::Image(_) | TaskError::Output(_) => false,
    }
  }
}

/// 对抽中的帧逐一分析
///
/// 单帧推理失败会写进该帧的记录，不会中断任务。已经得到记录之后的解码错误
/// 视为视频结束。
#[derive(Default, Debug)]
pub struct AnalyzeTask;

impl<'a, I, M, O> Task<I, &'a M, O> for AnalyzeTask
where
  I: Iterator<Item = Result<SampledFrame, SamplerError>>,
  M: FrameAnalyzer + ?Sized,
  O: Render<VideoFrame, FrameRecord>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = Vec<FrameRecord>;
  type Error = TaskError;

  fn run_task(self, input: I, model: &'a M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始分析任务...");
    let mut records: Vec<FrameRecord> = Vec::new();

    for sampled in input {
      let sampled = match sampled {
        Ok(sampled) => sampled,
        Err(SamplerError::Input(e)) if !records.is_empty() => {
          warn!("解码中断，按视频结束处理: {}", e);
          break;
        }
        Err(e) => return Err(e.into()),
      };

      let now = Instant::now();
      let result = model.analyze(&sampled.frame.image);
      match &result {
        Ok(_) => info!(
          "第 {} 帧 ({:.2}s) 分析完成，耗时: {:.2?}",
          sampled.frame_number,
          sampled.timestamp,
          now.elapsed()
        ),
        Err(e) => warn!("第 {} 帧分析失败: {}", sampled.frame_number, e),
      }

      let record = FrameRecord::new(&sampled, result)?;
      output
        .render_result(&sampled.frame, &record)
        .map_err(|e| TaskError::Output(Box::new(e)))?;
      records.push(record);
    }

    info!("分析任务完成，共 {} 帧", records.len());
    Ok(records)
  }
}

/// 逐帧处理直到输入结束、达到帧数上限或收到中断信号
///
/// 任一帧推理失败都会终止任务，该帧不会写到输出。
#[derive(Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  scale: f32,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      scale: 1.0,
    }
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 推理前按比例缩放帧
  pub fn with_scale(mut self, scale: f32) -> Self {
    self.scale = scale;
    self
  }

  fn run_loop<I, M, O, D, ME, RE>(
    &self,
    input: I,
    model: &M,
    output: &O,
    interrupt: &Receiver<()>,
  ) -> anyhow::Result<usize>
  where
    I: Iterator<Item = Result<VideoFrame, InputError>>,
    M: Model<Input = image::RgbImage, Output = D, Error = ME>,
    O: Render<VideoFrame, D, Error = RE>,
    ME: std::error::Error + Sync + Send + 'static,
    RE: std::error::Error + Sync + Send + 'static,
  {
    let mut frame_count = 0;
    let mut now = Instant::now();
    for frame in input {
      let frame = frame?.scaled(self.scale);
      frame_count += 1;
      info!("处理第 {} 帧图像", frame_count);
      let result = model.infer(&frame.image)?;
      let elapsed_a = now.elapsed();
      output.render_result(&frame, &result)?;
      let elapsed_b = now.elapsed();
      now = Instant::now();
      info!("推理完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);
      if self.frame_number.map(|n| frame_count >= n).unwrap_or(false) {
        info!("达到指定帧数 {}, 退出任务循环", frame_count);
        break;
      }
      if interrupt.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }
    Ok(frame_count)
  }
}

impl<I, M, O, D, ME, RE> Task<I, M, O> for ContinuousTask
where
  I: Iterator<Item = Result<VideoFrame, InputError>>,
  M: Model<Input = image::RgbImage, Output = D, Error = ME>,
  O: Render<VideoFrame, D, Error = RE>,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Output = usize;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let (tx, rx) = channel();

    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    let frame_count = self.run_loop(input, &model, &output, &rx)?;
    info!("任务完成，共处理 {} 帧", frame_count);
    Ok(frame_count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    input::VideoMeta,
    model::{Caption, ModelError},
    output::NullOutput,
    sampler::{SamplePolicy, sample},
  };
  use image::RgbImage;
  use std::{cell::RefCell, convert::Infallible};

  struct EchoAnalyzer;

  impl FrameAnalyzer for EchoAnalyzer {
    fn analyze(&self, image: &RgbImage) -> Result<Caption, ModelError> {
      let value = image.get_pixel(0, 0)[0];
      if value == 13 {
        return Err(ModelError::UnexpectedOutput("unlucky frame".to_string()));
      }
      Ok(Caption::Text(format!("pixel {}", value)))
    }
  }

  fn frames(n: u64) -> Vec<Result<VideoFrame, InputError>> {
    (0..n)
      .map(|i| {
        Ok(VideoFrame::new(
          i,
          i * 100,
          RgbImage::from_pixel(4, 4, image::Rgb([i as u8, 0, 0])),
        ))
      })
      .collect()
  }

  fn meta(fps: f64, frames: u64) -> VideoMeta {
    VideoMeta {
      width: 4,
      height: 4,
      fps: Some(fps),
      duration: Some(Duration::from_secs_f64(frames as f64 / fps)),
    }
  }

  #[test]
  fn test_analyze_every_interval() {
    let sampled = sample(frames(20).into_iter(), &meta(5.0, 20), SamplePolicy::Every { seconds: 2.0 }).unwrap();
    let records = AnalyzeTask.run_task(sampled, &EchoAnalyzer, NullOutput).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].frame_number, 10);
    assert_eq!(records[0].caption, Some(Caption::Text("pixel 9".to_string())));
    assert_eq!(records[1].frame_number, 20);
    assert!((records[1].timestamp - 4.0).abs() < 1e-9);
  }

  #[test]
  fn test_failed_frame_is_recorded() {
    let sampled = sample(frames(16).into_iter(), &meta(10.0, 16), SamplePolicy::All).unwrap();
    let records = AnalyzeTask.run_task(sampled, &EchoAnalyzer, NullOutput).unwrap();
    assert_eq!(records.len(), 16);
    assert!(records[13].caption.is_none());
    assert!(records[13].error.as_deref().unwrap().contains("unlucky"));
    assert!(records[14].caption.is_some());
  }

  #[test]
  fn test_analyze_without_frames() {
    let sampled = sample(frames(0).into_iter(), &meta(10.0, 1), SamplePolicy::All).unwrap();
    let err = AnalyzeTask
      .run_task(sampled, &EchoAnalyzer, NullOutput)
      .unwrap_err();
    assert!(matches!(err, TaskError::Sampler(SamplerError::NoFrames)));
    assert!(err.is_client_error());
  }

  #[test]
  fn test_decode_error_after_frames_ends_video() {
    let mut input = frames(3);
    input.push(Err(InputError::SchemeMismatch));
    let sampled = sample(input.into_iter(), &meta(10.0, 4), SamplePolicy::All).unwrap();
    let records = AnalyzeTask.run_task(sampled, &EchoAnalyzer, NullOutput).unwrap();
    assert_eq!(records.len(), 3);
  }

  #[test]
  fn test_analyze_with_dyn_analyzer() {
    let analyzer: std::sync::Arc<dyn FrameAnalyzer> = std::sync::Arc::new(EchoAnalyzer);
    let sampled = sample(frames(4).into_iter(), &meta(2.0, 4), SamplePolicy::FirstAndLast).unwrap();
    let records = AnalyzeTask
      .run_task(sampled, analyzer.as_ref(), NullOutput)
      .unwrap();
    assert_eq!(
      records.iter().map(|r| r.frame_number).collect::<Vec<_>>(),
      vec![1, 4]
    );
  }

  struct Invert;

  impl Model for Invert {
    type Input = RgbImage;
    type Output = RgbImage;
    type Error = ModelError;

    fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
      let mut image = input.clone();
      image::imageops::invert(&mut image);
      Ok(image)
    }
  }

  struct FailOn(u8);

  impl Model for FailOn {
    type Input = RgbImage;
    type Output = RgbImage;
    type Error = ModelError;

    fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
      if input.get_pixel(0, 0)[0] == self.0 {
        return Err(ModelError::UnexpectedOutput("detector offline".to_string()));
      }
      Ok(input.clone())
    }
  }

  #[derive(Default)]
  struct Collect {
    frames: RefCell<Vec<(u64, u8)>>,
  }

  impl Render<VideoFrame, RgbImage> for &Collect {
    type Error = Infallible;

    fn render_result(&self, frame: &VideoFrame, result: &RgbImage) -> Result<(), Self::Error> {
      self.frames.borrow_mut().push((frame.index, result.get_pixel(0, 0)[0]));
      Ok(())
    }
  }

  #[test]
  fn test_continuous_stops_at_frame_number() {
    let (_tx, rx) = channel();
    let collect = Collect::default();
    let count = ContinuousTask::default()
      .with_frame_number(Some(3))
      .run_loop(frames(10).into_iter(), &Invert, &&collect, &rx)
      .unwrap();
    assert_eq!(count, 3);
    assert_eq!(*collect.frames.borrow(), vec![(0, 255), (1, 254), (2, 253)]);
  }

  #[test]
  fn test_continuous_fails_closed() {
    let (_tx, rx) = channel();
    let collect = Collect::default();
    let result = ContinuousTask::default().run_loop(frames(10).into_iter(), &FailOn(2), &&collect, &rx);
    assert!(result.is_err());
    // 失败的帧以及之后的帧都不会写出
    assert_eq!(collect.frames.borrow().len(), 2);
  }

  #[test]
  fn test_continuous_aborts_on_decode_error() {
    let (_tx, rx) = channel();
    let collect = Collect::default();
    let mut input = frames(2);
    input.push(Err(InputError::SchemeMismatch));
    input.extend(frames(2));
    let result = ContinuousTask::default().run_loop(input.into_iter(), &Invert, &&collect, &rx);
    assert!(result.is_err());
    assert_eq!(collect.frames.borrow().len(), 2);
  }

  #[test]
  fn test_continuous_stops_on_interrupt() {
    let (tx, rx) = channel();
    tx.send(()).unwrap();
    let collect = Collect::default();
    let count = ContinuousTask::default()
      .run_loop(frames(10).into_iter(), &Invert, &&collect, &rx)
      .unwrap();
    assert_eq!(count, 1);
  }

  #[test]
  fn test_continuous_scales_frames() {
    let (_tx, rx) = channel();
    struct Size;
    impl Model for Size {
      type Input = RgbImage;
      type Output = (u32, u32);
      type Error = ModelError;
      fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
        Ok(input.dimensions())
      }
    }
    struct AssertHalf;
    impl Render<VideoFrame, (u32, u32)> for AssertHalf {
      type Error = Infallible;
      fn render_result(&self, frame: &VideoFrame, result: &(u32, u32)) -> Result<(), Self::Error> {
        assert_eq!(*result, (2, 2));
        assert_eq!(frame.width(), 2);
        Ok(())
      }
    }
    let count = ContinuousTask::default()
      .with_scale(0.5)
      .run_loop(frames(2).into_iter(), &Size, &AssertHalf, &rx)
      .unwrap();
    assert_eq!(count, 2);
  }
}
