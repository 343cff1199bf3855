// 该文件是 Shijing （视镜） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::time::Duration;

use thiserror::Error;

use crate::{FromUrl, frame::VideoFrame};

/// 打开输入后得到的视频信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMeta {
  pub width: u32,
  pub height: u32,
  pub fps: Option<f64>,
  pub duration: Option<Duration>,
}

/// 可迭代的帧来源
pub trait FrameSource: Iterator<Item = Result<VideoFrame, InputError>> {
  fn meta(&self) -> VideoMeta;
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

mod image_folder;
pub use self::image_folder::ImageFolderInput;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image decoding error: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

impl InputError {
  /// 是否由输入内容（而不是服务配置）导致
  pub fn is_client_error(&self) -> bool {
    match self {
      #[cfg(feature = "read_image_file")]
      InputError::ImageFileInputError(e) => !matches!(e, ImageFileInputError::SchemaMismatch),
      #[cfg(feature = "gstreamer_input")]
      InputError::GStreamerInputError(e) => e.is_client_error(),
      InputError::IoError(_) | InputError::ImageError(_) => true,
      InputError::SchemeMismatch => false,
    }
  }
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  ImageFolder(ImageFolderInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    #[cfg(feature = "gstreamer_input")]
    {
      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    if url.scheme() == ImageFolderInput::SCHEME {
      let input = ImageFolderInput::from_url(url)?;
      return Ok(InputWrapper::ImageFolder(input));
    }
    Err(InputError::SchemeMismatch)
  }
}

impl Iterator for InputWrapper {
  type Item = Result<VideoFrame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
      InputWrapper::ImageFolder(input) => input.next(),
    }
  }
}

impl FrameSource for InputWrapper {
  fn meta(&self) -> VideoMeta {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.meta(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.meta(),
      InputWrapper::ImageFolder(input) => input.meta(),
    }
  }
}

fn local_file_url(prefix: &str, path: &std::path::Path) -> Result<url::Url, url::ParseError> {
  let encoded = path
    .to_string_lossy()
    .split('/')
    .map(|part| urlencoding::encode(part).into_owned())
    .collect::<Vec<_>>()
    .join("/");
  let encoded = encoded.trim_start_matches('/');
  url::Url::parse(&format!("{}/{}", prefix, encoded))
}

/// 是否编译了视频文件解码
pub const VIDEO_INPUT_SUPPORTED: bool = cfg!(feature = "gstreamer_input");

/// 为本地视频文件构造输入地址
pub fn video_file_url(path: &std::path::Path) -> Result<url::Url, url::ParseError> {
  local_file_url("gst://file", path)
}

/// 为本地图片文件构造输入地址
pub fn image_file_url(path: &std::path::Path) -> Result<url::Url, url::ParseError> {
  local_file_url("image://", path)
}
