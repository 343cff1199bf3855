// 该文件是 Shijing （视镜） 项目的一部分。
// src/privacy.rs - 路人人脸打码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::RgbImage;
use tracing::debug;

use crate::{
  geometry::{BBox, filter_boxes},
  model::{
    FlorenceModel, FlorenceTask, LabeledBox, MaskGenerator, MaskGeneratorWrapper, Model,
    ModelError,
  },
  pixelate::{DEFAULT_BLOCK_SIZE, pixelate_region},
};

pub const FACE_LABEL: &str = "human face";
pub const MAIN_SPEAKER_PHRASE: &str = "human face (main speaker)";

/// 只保留标签为人脸的检测框
pub fn face_boxes(items: Vec<LabeledBox>) -> Vec<BBox> {
  items
    .into_iter()
    .filter(|item| item.label == FACE_LABEL)
    .map(|item| item.bbox)
    .collect()
}

/// 人脸检测
pub trait FaceFinder: Send + Sync {
  /// 画面中所有人脸
  fn find_all_faces(&self, image: &RgbImage) -> Result<Vec<BBox>, ModelError>;

  /// 主讲人的人脸
  fn find_main_speakers(&self, image: &RgbImage) -> Result<Vec<BBox>, ModelError>;

  /// 去掉与主讲人重叠的人脸后剩下的路人
  fn find_passersby(&self, image: &RgbImage) -> Result<Vec<BBox>, ModelError> {
    let all_faces = self.find_all_faces(image)?;
    let main_speakers = self.find_main_speakers(image)?;
    let passersby = filter_boxes(&all_faces, &main_speakers);
    debug!(
      "人脸 {} 个, 主讲人 {} 个, 路人 {} 个",
      all_faces.len(),
      main_speakers.len(),
      passersby.len()
    );
    Ok(passersby)
  }
}

impl FaceFinder for FlorenceModel {
  fn find_all_faces(&self, image: &RgbImage) -> Result<Vec<BBox>, ModelError> {
    let items = self
      .run_task(FlorenceTask::ObjectDetection, "", image)?
      .into_boxes()?;
    Ok(face_boxes(items))
  }

  fn find_main_speakers(&self, image: &RgbImage) -> Result<Vec<BBox>, ModelError> {
    let items = self
      .run_task(FlorenceTask::PhraseGrounding, MAIN_SPEAKER_PHRASE, image)?
      .into_boxes()?;
    Ok(face_boxes(items))
  }
}

/// 打码对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedactTarget {
  #[default]
  Passersby,
  AllFaces,
}

/// 一帧的打码结果
#[derive(Debug, Clone)]
pub struct Redaction {
  pub image: RgbImage,
  /// 被打码的人脸框
  pub boxes: Vec<BBox>,
}

/// 检测人脸、生成掩码并像素化
pub struct FacePixelator<F = FlorenceModel, G = MaskGeneratorWrapper> {
  finder: F,
  masks: G,
  block_size: u32,
  target: RedactTarget,
}

impl<F: FaceFinder, G: MaskGenerator> FacePixelator<F, G> {
  pub fn new(finder: F, masks: G) -> Self {
    Self {
      finder,
      masks,
      block_size: DEFAULT_BLOCK_SIZE,
      target: RedactTarget::default(),
    }
  }

  pub fn with_block_size(mut self, block_size: u32) -> Self {
    self.block_size = block_size.max(1);
    self
  }

  pub fn with_target(mut self, target: RedactTarget) -> Self {
    self.target = target;
    self
  }

  /// 对一帧打码，没有目标时原样返回
  pub fn redact(&self, image: &RgbImage) -> Result<Redaction, ModelError> {
    let boxes = match self.target {
      RedactTarget::Passersby => self.finder.find_passersby(image)?,
      RedactTarget::AllFaces => self.finder.find_all_faces(image)?,
    };
    if boxes.is_empty() {
      return Ok(Redaction {
        image: image.clone(),
        boxes,
      });
    }

    let masks = self.masks.generate(image, &boxes)?;
    let image = pixelate_region(image, &masks, self.block_size);
    Ok(Redaction { image, boxes })
  }
}

impl<F: FaceFinder, G: MaskGenerator> Model for FacePixelator<F, G> {
  type Input = RgbImage;
  type Output = Redaction;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.redact(input)
  }
}
