// 该文件是 Shijing （视镜） 项目的一部分。
// src/input/image_folder.rs - 图片目录输入
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

use std::{collections::VecDeque, path::PathBuf};

use image::ImageReader;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::VideoFrame,
  input::{InputError, VideoMeta},
  url_file_path,
};

const FRAME_EXTENSIONS: [&str; 3] = ["jpeg", "jpg", "png"];

/// 按文件名顺序读取目录中已经抽出的帧
///
/// 地址形如 `folder:///path/to/frames?fps=30`。
pub struct ImageFolderInput {
  paths: VecDeque<PathBuf>,
  next_index: u64,
  fps: Option<f64>,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for ImageFolderInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for ImageFolderInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::SchemeMismatch);
    }

    let fps = url
      .query_pairs()
      .find(|(k, _)| k == "fps")
      .and_then(|(_, v)| v.parse::<f64>().ok());

    let directory = PathBuf::from(url_file_path(url));
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(&directory)? {
      let path = entry?.path();
      let matched = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
      if matched {
        paths.push(path);
      }
    }
    paths.sort();
    info!("目录 {} 中共有 {} 帧", directory.display(), paths.len());

    let (width, height) = match paths.first() {
      Some(first) => ImageReader::open(first)?.into_dimensions()?,
      None => (0, 0),
    };

    Ok(ImageFolderInput {
      paths: paths.into(),
      next_index: 0,
      fps,
      width,
      height,
    })
  }
}

impl ImageFolderInput {
  pub fn meta(&self) -> VideoMeta {
    VideoMeta {
      width: self.width,
      height: self.height,
      fps: self.fps,
      duration: None,
    }
  }
}

impl Iterator for ImageFolderInput {
  type Item = Result<VideoFrame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.paths.pop_front()?;
    debug!("读取帧 {}", path.display());
    let index = self.next_index;
    self.next_index += 1;
    let timestamp_ms = self
      .fps
      .filter(|fps| *fps > 0.0)
      .map_or(0, |fps| (index as f64 * 1000.0 / fps) as u64);

    let result = ImageReader::open(&path)
      .map_err(InputError::from)
      .and_then(|reader| reader.decode().map_err(InputError::from))
      .map(|image| VideoFrame::new(index, timestamp_ms, image.to_rgb8()));
    Some(result)
  }
}
