// 该文件是 Shijing （视镜） 项目的一部分。
// src/bin/pixelate_video.rs - 视频路人人脸打码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shijing::{
  FromUrl,
  input::InputWrapper,
  model::{FlorenceModel, MaskGeneratorWrapper},
  output::OutputWrapper,
  pixelate::DEFAULT_BLOCK_SIZE,
  privacy::{FacePixelator, RedactTarget},
  task::{ContinuousTask, Task},
};

/// 人脸打码参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源，如 gst://file/path/to/video.mp4
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  /// 支持:
  /// - folder:///out?draw=boxes&font=/path/font.ttf
  /// - image:///out.png
  /// - gst:///out.mp4?fps=30
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 人脸检测模型地址
  #[arg(
    long,
    default_value = "florence://127.0.0.1:8001/florence?max_new_tokens=2048",
    value_name = "MODEL"
  )]
  pub detector: Url,
  /// 掩码生成方式: box:// 或 sam://host:port/<path>
  #[arg(long, default_value = "box://", value_name = "MASKS")]
  pub masks: Url,
  /// 像素块边长
  #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE, value_name = "PIXELS")]
  pub block_size: u32,
  /// 处理前的缩放比例
  #[arg(long, default_value_t = 1.0, value_name = "FACTOR")]
  pub scale: f32,
  /// 对所有人脸打码，而不只是路人
  #[arg(long)]
  pub all_faces: bool,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);
  info!("检测模型: {}", args.detector);
  info!("掩码生成: {}", args.masks);

  let target = if args.all_faces {
    RedactTarget::AllFaces
  } else {
    RedactTarget::Passersby
  };
  let pixelator = FacePixelator::new(
    FlorenceModel::from_url(&args.detector)?,
    MaskGeneratorWrapper::from_url(&args.masks)?,
  )
  .with_block_size(args.block_size)
  .with_target(target);

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .with_scale(args.scale)
    .run_task(input, pixelator, output)?;

  Ok(())
}
