// 该文件是 Shijing （视镜） 项目的一部分。
// src/bin/server.rs - 视频分析 HTTP 服务
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use shijing::{
  FromUrl,
  input::VIDEO_INPUT_SUPPORTED,
  model::{AnalyzerWrapper, FrameAnalyzer},
  sampler::SamplePolicy,
  server::{AppState, DEFAULT_MAX_UPLOAD_BYTES, router, upload_limit_from_mib},
};

/// Shijing 视频分析服务参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址
  #[arg(long, default_value = "0.0.0.0:8000", value_name = "ADDR")]
  pub listen: String,
  /// 帧分析模型地址
  /// 支持:
  /// - ollama://host:port/<model>?prompt=medicine|text
  /// - caption://host:port/<path>?token=...
  /// - florence://host:port/<path>?task=ocr|caption|medicine
  #[arg(
    long,
    default_value = "ollama://127.0.0.1:11434/llama3.2-vision:11b",
    value_name = "MODEL"
  )]
  pub analyzer: Url,
  /// 抽帧策略: every:<秒>、first-last 或 all
  #[arg(long, default_value = "every:2", value_name = "POLICY")]
  pub sample: SamplePolicy,
  /// 上传文件的临时目录，默认在系统临时目录下
  #[arg(long, value_name = "DIR")]
  pub upload_dir: Option<PathBuf>,
  /// 单次上传大小上限（MiB）
  #[arg(long, value_name = "MIB")]
  pub max_upload_mb: Option<usize>,
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("无法监听中断信号: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到中断信号，准备退出...");
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  if !VIDEO_INPUT_SUPPORTED {
    anyhow::bail!("未启用视频解码，请使用 --features gstreamer_input 构建服务");
  }

  info!("分析模型: {}", args.analyzer);
  info!("抽帧策略: {}", args.sample);

  // 模型客户端是阻塞式的，需要在异步运行时之外创建和释放
  let analyzer: Arc<dyn FrameAnalyzer> = Arc::new(AnalyzerWrapper::from_url(&args.analyzer)?);

  let upload_dir = args
    .upload_dir
    .unwrap_or_else(|| std::env::temp_dir().join("shijing-uploads"));
  std::fs::create_dir_all(&upload_dir)?;
  info!("上传目录: {}", upload_dir.display());

  let max_upload_bytes = match args.max_upload_mb {
    Some(mb) => upload_limit_from_mib(mb)
      .ok_or_else(|| anyhow::anyhow!("上传大小上限过大: {} MiB", mb))?,
    None => DEFAULT_MAX_UPLOAD_BYTES,
  };
  let app = router(
    AppState::new(analyzer.clone(), args.sample, upload_dir),
    max_upload_bytes,
  );

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;
  let listen = args.listen;
  runtime.block_on(async move {
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("服务监听 {}", listener.local_addr()?);
    axum::serve(listener, app)
      .with_graceful_shutdown(shutdown_signal())
      .await?;
    anyhow::Ok(())
  })?;
  drop(runtime);
  drop(analyzer);

  info!("服务已退出");
  Ok(())
}
