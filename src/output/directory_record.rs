// 该文件是 Shijing （视镜） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::VideoFrame,
  geometry::BBox,
  output::{
    Annotated, Render,
    draw::{Draw, DrawError},
  },
  url_file_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
}

/// 把框写到与图像同名的 `.txt` 文件，每行 `label, x_min, y_min, x_max, y_max`
fn record_boxes(path: &Path, label: &str, boxes: &[BBox]) -> Result<(), std::io::Error> {
  let records: Vec<String> = boxes
    .iter()
    .map(|bbox| {
      format!(
        "{}, {:.1}, {:.1}, {:.1}, {:.1}",
        label,
        bbox.x_min(),
        bbox.y_min(),
        bbox.x_max(),
        bbox.y_max()
      )
    })
    .collect();
  std::fs::write(path.with_extension("txt"), records.join("\n"))
}

/// 逐帧写入目录，文件名为从 0 开始的帧序号 `00000.jpeg`
///
/// 地址形如 `folder:///out?draw=boxes&font=/path/font.ttf&record`。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: Option<Draw>,
  record: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let directory = PathBuf::from(url_file_path(uri));
    std::fs::create_dir_all(&directory)?;

    Ok(DirectoryRecordOutput {
      directory,
      draw: Draw::from_query(uri)?,
      record: uri.query_pairs().any(|(k, _)| k == "record"),
    })
  }
}

impl DirectoryRecordOutput {
  pub fn frame_path(&self, index: u64) -> PathBuf {
    self.directory.join(format!("{:05}.jpeg", index))
  }
}

impl<T: Annotated> Render<VideoFrame, T> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &VideoFrame, result: &T) -> Result<(), Self::Error> {
    let path = self.frame_path(frame.index);
    let image = result.output_image(frame);
    match &self.draw {
      Some(draw) => {
        let mut image = image.clone();
        draw.draw_boxes(&mut image, result.boxes(), result.label());
        image.save(&path)?;
      }
      None => image.save(&path)?,
    }
    if self.record {
      record_boxes(&path, result.label(), result.boxes())?;
    }
    debug!("保存第 {} 帧到 {}", frame.index, path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::privacy::Redaction;
  use image::RgbImage;
  use url::Url;

  fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("shijing-{}-{}", name, std::process::id()))
  }

  #[test]
  fn test_frames_are_named_by_index() {
    let dir = temp_dir("folder-output");
    let url = Url::parse(&format!("folder://{}?record", dir.display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    for index in [0u64, 1, 12] {
      let frame = VideoFrame::new(index, index * 33, RgbImage::new(16, 16));
      let redaction = Redaction {
        image: frame.image.clone(),
        boxes: vec![BBox::new(1.0, 2.0, 3.0, 4.0)],
      };
      output.render_result(&frame, &redaction).unwrap();
    }

    assert!(dir.join("00000.jpeg").exists());
    assert!(dir.join("00001.jpeg").exists());
    assert!(dir.join("00012.jpeg").exists());
    let record = std::fs::read_to_string(dir.join("00012.txt")).unwrap();
    assert_eq!(record, "human face, 1.0, 2.0, 3.0, 4.0");
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn test_no_record_file_by_default() {
    let dir = temp_dir("folder-output-plain");
    let url = Url::parse(&format!("folder://{}?draw=boxes", dir.display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    let frame = VideoFrame::new(3, 0, RgbImage::new(8, 8));
    let redaction = Redaction {
      image: frame.image.clone(),
      boxes: vec![BBox::new(1.0, 1.0, 5.0, 5.0)],
    };
    output.render_result(&frame, &redaction).unwrap();
    assert!(dir.join("00003.jpeg").exists());
    assert!(!dir.join("00003.txt").exists());
    std::fs::remove_dir_all(&dir).unwrap();
  }
}
