// 该文件是 Shijing （视镜） 项目的一部分。
// src/pixelate.rs - 掩码区域像素化
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

use image::{GrayImage, Rgb, RgbImage};

use crate::geometry::BBox;

pub const DEFAULT_BLOCK_SIZE: u32 = 10;

/// 与帧同尺寸的二值掩码
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMask {
  width: u32,
  height: u32,
  bits: Box<[bool]>,
}

impl FaceMask {
  pub fn empty(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      bits: vec![false; (width as usize) * (height as usize)].into_boxed_slice(),
    }
  }

  /// 将矩形内的像素全部标记
  pub fn from_bbox(width: u32, height: u32, bbox: &BBox) -> Self {
    let mut mask = Self::empty(width, height);
    if let Some((x0, y0, x1, y1)) = bbox.clamp_to(width, height) {
      for y in y0..y1 {
        for x in x0..x1 {
          mask.set(x, y, true);
        }
      }
    }
    mask
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn get(&self, x: u32, y: u32) -> bool {
    self.bits[(y as usize) * (self.width as usize) + (x as usize)]
  }

  pub fn set(&mut self, x: u32, y: u32, value: bool) {
    self.bits[(y as usize) * (self.width as usize) + (x as usize)] = value;
  }

  pub fn count(&self) -> usize {
    self.bits.iter().filter(|bit| **bit).count()
  }

  pub fn any(&self) -> bool {
    self.bits.iter().any(|bit| *bit)
  }
}

impl From<&GrayImage> for FaceMask {
  // 非零像素视为掩码
  fn from(image: &GrayImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      bits: image.pixels().map(|p| p[0] > 0).collect(),
    }
  }
}

/// 对掩码覆盖的区域做块像素化
///
/// 图像按 `block_size` 切成方块（边缘块会被截断）。与任一掩码相交的块中，
/// 所有被掩码覆盖的像素替换为这些像素各通道的整数均值，其余像素保持不变。
/// 尺寸与图像不一致的掩码会被忽略。
pub fn pixelate_region(image: &RgbImage, masks: &[FaceMask], block_size: u32) -> RgbImage {
  let (width, height) = image.dimensions();
  let block_size = block_size.max(1);
  let masks: Vec<&FaceMask> = masks
    .iter()
    .filter(|m| m.width == width && m.height == height)
    .collect();
  let mut output = image.clone();
  if masks.is_empty() {
    return output;
  }

  let masked = |x: u32, y: u32| masks.iter().any(|m| m.get(x, y));

  for y in (0..height).step_by(block_size as usize) {
    for x in (0..width).step_by(block_size as usize) {
      let y_end = (y + block_size).min(height);
      let x_end = (x + block_size).min(width);

      let mut sum = [0u64; 3];
      let mut count = 0u64;
      for by in y..y_end {
        for bx in x..x_end {
          if masked(bx, by) {
            let Rgb(pixel) = image.get_pixel(bx, by);
            for c in 0..3 {
              sum[c] += pixel[c] as u64;
            }
            count += 1;
          }
        }
      }

      if count == 0 {
        continue;
      }

      let mean = Rgb([
        (sum[0] / count) as u8,
        (sum[1] / count) as u8,
        (sum[2] / count) as u8,
      ]);
      for by in y..y_end {
        for bx in x..x_end {
          if masked(bx, by) {
            output.put_pixel(bx, by, mean);
          }
        }
      }
    }
  }

  output
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_masked_pixels_get_integer_mean() {
    let mut image = RgbImage::from_pixel(2, 2, Rgb([9, 9, 9]));
    image.put_pixel(0, 0, Rgb([10, 20, 30]));
    image.put_pixel(1, 0, Rgb([11, 21, 31]));
    image.put_pixel(0, 1, Rgb([13, 25, 0]));

    let mut mask = FaceMask::empty(2, 2);
    mask.set(0, 0, true);
    mask.set(1, 0, true);
    mask.set(0, 1, true);

    let out = pixelate_region(&image, &[mask], 10);
    // (10+11+13)/3 = 11, (20+21+25)/3 = 22, (30+31+0)/3 = 20
    assert_eq!(*out.get_pixel(0, 0), Rgb([11, 22, 20]));
    assert_eq!(*out.get_pixel(1, 0), Rgb([11, 22, 20]));
    assert_eq!(*out.get_pixel(0, 1), Rgb([11, 22, 20]));
    // 未被掩码覆盖的像素保持原值
    assert_eq!(*out.get_pixel(1, 1), Rgb([9, 9, 9]));
  }

  #[test]
  fn test_blocks_are_averaged_independently() {
    let mut image = RgbImage::new(4, 2);
    for y in 0..2 {
      image.put_pixel(0, y, Rgb([0, 0, 0]));
      image.put_pixel(1, y, Rgb([100, 100, 100]));
      image.put_pixel(2, y, Rgb([200, 200, 200]));
      image.put_pixel(3, y, Rgb([255, 255, 255]));
    }
    let mask = FaceMask::from_bbox(4, 2, &BBox::new(0.0, 0.0, 4.0, 2.0));

    let out = pixelate_region(&image, &[mask], 2);
    assert_eq!(*out.get_pixel(0, 0), Rgb([50, 50, 50]));
    assert_eq!(*out.get_pixel(1, 1), Rgb([50, 50, 50]));
    // (200+255)/2 = 227
    assert_eq!(*out.get_pixel(2, 0), Rgb([227, 227, 227]));
    assert_eq!(*out.get_pixel(3, 1), Rgb([227, 227, 227]));
  }

  #[test]
  fn test_masks_are_combined() {
    let image = RgbImage::from_fn(3, 1, |x, _| Rgb([(x * 30) as u8, 0, 0]));
    let mut left = FaceMask::empty(3, 1);
    left.set(0, 0, true);
    let mut right = FaceMask::empty(3, 1);
    right.set(2, 0, true);

    let out = pixelate_region(&image, &[left, right], 3);
    assert_eq!(*out.get_pixel(0, 0), Rgb([30, 0, 0]));
    assert_eq!(*out.get_pixel(1, 0), Rgb([30, 0, 0]));
    assert_eq!(*out.get_pixel(2, 0), Rgb([30, 0, 0]));
  }

  #[test]
  fn test_edge_blocks_are_clipped() {
    let image = RgbImage::from_fn(5, 5, |x, y| Rgb([(x + y * 5) as u8, 0, 0]));
    let mask = FaceMask::from_bbox(5, 5, &BBox::new(0.0, 0.0, 5.0, 5.0));
    let out = pixelate_region(&image, &[mask], 4);
    // 右下角块只有 (4,4) 一个像素
    assert_eq!(*out.get_pixel(4, 4), Rgb([24, 0, 0]));
    // 右侧块为 x=4, y=0..4: 4, 9, 14, 19 -> 11
    assert_eq!(*out.get_pixel(4, 0), Rgb([11, 0, 0]));
  }

  #[test]
  fn test_without_masks_image_is_unchanged() {
    let image = RgbImage::from_fn(6, 6, |x, y| Rgb([x as u8, y as u8, 7]));
    assert_eq!(pixelate_region(&image, &[], 3), image);
    let wrong_size = FaceMask::from_bbox(3, 3, &BBox::new(0.0, 0.0, 3.0, 3.0));
    assert_eq!(pixelate_region(&image, &[wrong_size], 3), image);
  }

  #[test]
  fn test_mask_from_gray_image() {
    let mut gray = GrayImage::new(3, 2);
    gray.put_pixel(1, 1, image::Luma([255]));
    let mask = FaceMask::from(&gray);
    assert!(mask.get(1, 1));
    assert_eq!(mask.count(), 1);
  }
}
