// 该文件是 Shijing （视镜） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::VideoFrame,
  output::{
    Annotated, Render,
    draw::{Draw, DrawError},
  },
  url_file_path,
};

/// 把结果写到单个图像文件，每次渲染都会覆盖
pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Option<Draw>,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: PathBuf::from(url_file_path(uri)),
      draw: Draw::from_query(uri)?,
    })
  }
}

impl SaveImageFileOutput {
  fn save_image(&self, image: &image::RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;
    info!("保存图像到文件: {}", self.path.display());

    Ok(())
  }
}

impl<T: Annotated> Render<VideoFrame, T> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &VideoFrame, result: &T) -> Result<(), Self::Error> {
    let image = result.output_image(frame);
    match &self.draw {
      Some(draw) => {
        let mut image = image.clone();
        draw.draw_boxes(&mut image, result.boxes(), result.label());
        self.save_image(&image)
      }
      None => self.save_image(image),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{geometry::BBox, privacy::Redaction};
  use image::{Rgb, RgbImage};

  #[test]
  fn test_saves_redacted_image() {
    let dir = std::env::temp_dir().join(format!("shijing-save-image-{}", std::process::id()));
    let path = dir.join("nested").join("out.png");
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();

    let frame = VideoFrame::new(0, 0, RgbImage::new(4, 4));
    let redaction = Redaction {
      image: RgbImage::from_pixel(4, 4, Rgb([10, 20, 30])),
      boxes: vec![BBox::new(0.0, 0.0, 2.0, 2.0)],
    };
    output.render_result(&frame, &redaction).unwrap();

    let saved = image::open(&path).unwrap().to_rgb8();
    assert_eq!(*saved.get_pixel(3, 3), Rgb([10, 20, 30]));
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn test_scheme_mismatch() {
    let url = Url::parse("folder:///tmp/out").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }
}
