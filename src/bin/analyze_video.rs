// 该文件是 Shijing （视镜） 项目的一部分。
// src/bin/analyze_video.rs - 对单个视频抽帧并逐帧分析
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{fs::File, io::BufWriter, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shijing::{
  FromUrl,
  input::{FrameSource, InputWrapper},
  model::AnalyzerWrapper,
  output::{NullOutput, OutputWrapper},
  sampler::{SamplePolicy, sample},
  task::{AnalyzeTask, Task},
};

/// 视频逐帧分析参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源，如 gst://file/path/to/video.mp4 或 folder:///frames?fps=30
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 帧分析模型地址
  #[arg(long, value_name = "MODEL")]
  pub analyzer: Url,
  /// 抽帧策略: every:<秒>、first-last 或 all
  #[arg(long, default_value = "every:2", value_name = "POLICY")]
  pub sample: SamplePolicy,
  /// 另外保存被抽中的帧，如 folder:///out
  #[arg(long, value_name = "OUTPUT")]
  pub frames: Option<Url>,
  /// 分析结果 JSON 文件，不指定时输出到标准输出
  #[arg(long, value_name = "FILE")]
  pub json: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("分析模型: {}", args.analyzer);
  info!("抽帧策略: {}", args.sample);

  let model = AnalyzerWrapper::from_url(&args.analyzer)?;
  let input = InputWrapper::from_url(&args.input)?;
  let meta = input.meta();
  info!(
    "视频 {}x{}, 帧率 {:?}, 时长 {:?}",
    meta.width, meta.height, meta.fps, meta.duration
  );
  let sampled = sample(input, &meta, args.sample)?;

  let records = match &args.frames {
    Some(url) => {
      let output = OutputWrapper::from_url(url)?;
      AnalyzeTask.run_task(sampled, &model, output)?
    }
    None => AnalyzeTask.run_task(sampled, &model, NullOutput)?,
  };

  let failed = records.iter().filter(|r| r.is_failed()).count();
  info!("共分析 {} 帧，其中 {} 帧失败", records.len(), failed);

  match &args.json {
    Some(path) => {
      let writer = BufWriter::new(File::create(path)?);
      serde_json::to_writer_pretty(writer, &records)?;
      info!("结果已写入 {}", path.display());
    }
    None => {
      serde_json::to_writer_pretty(std::io::stdout().lock(), &records)?;
      println!();
    }
  }

  Ok(())
}
