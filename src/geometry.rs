// 该文件是 Shijing （视镜） 项目的一部分。
// src/geometry.rs - 边界框与重叠过滤
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

use serde::{Deserialize, Serialize};

/// 主讲人过滤使用的固定重叠阈值
pub const OVERLAP_THRESHOLD: f32 = 0.7;

/// 像素坐标下的轴对齐矩形 `[x_min, y_min, x_max, y_max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BBox(pub [f32; 4]);

impl BBox {
  pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    Self([x_min, y_min, x_max, y_max])
  }

  pub fn x_min(&self) -> f32 {
    self.0[0]
  }

  pub fn y_min(&self) -> f32 {
    self.0[1]
  }

  pub fn x_max(&self) -> f32 {
    self.0[2]
  }

  pub fn y_max(&self) -> f32 {
    self.0[3]
  }

  pub fn area(&self) -> f32 {
    (self.x_max() - self.x_min()) * (self.y_max() - self.y_min())
  }

  pub fn intersection_area(&self, other: &BBox) -> f32 {
    let x_overlap = (self.x_max().min(other.x_max()) - self.x_min().max(other.x_min())).max(0.0);
    let y_overlap = (self.y_max().min(other.y_max()) - self.y_min().max(other.y_min())).max(0.0);
    x_overlap * y_overlap
  }

  /// 交集面积不小于较小框面积的 `threshold` 倍时视为重叠
  pub fn is_overlapping(&self, other: &BBox, threshold: f32) -> bool {
    let min_area = self.area().min(other.area());
    self.intersection_area(other) >= threshold * min_area
  }

  /// 裁剪到 `width x height` 的图像内，返回整数像素范围 `(x0, y0, x1, y1)`（右下开区间）
  pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let x0 = self.x_min().floor().clamp(0.0, width as f32) as u32;
    let y0 = self.y_min().floor().clamp(0.0, height as f32) as u32;
    let x1 = self.x_max().ceil().clamp(0.0, width as f32) as u32;
    let y1 = self.y_max().ceil().clamp(0.0, height as f32) as u32;
    if x0 >= x1 || y0 >= y1 {
      return None;
    }
    Some((x0, y0, x1, y1))
  }
}

impl From<[f32; 4]> for BBox {
  fn from(value: [f32; 4]) -> Self {
    BBox(value)
  }
}

/// 从 `initial` 中去掉与 `others` 任一框重叠的框，保持原有顺序
pub fn filter_boxes(initial: &[BBox], others: &[BBox]) -> Vec<BBox> {
  initial
    .iter()
    .filter(|bbox| {
      !others
        .iter()
        .any(|other| bbox.is_overlapping(other, OVERLAP_THRESHOLD))
    })
    .copied()
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_identical_boxes_are_removed() {
    let unit = BBox::new(0.0, 0.0, 1.0, 1.0);
    assert!(filter_boxes(&[unit], &[unit]).is_empty());
  }

  #[test]
  fn test_disjoint_boxes_are_kept() {
    let a = BBox::new(0.0, 0.0, 1.0, 1.0);
    let b = BBox::new(5.0, 5.0, 6.0, 6.0);
    assert_eq!(filter_boxes(&[a], &[b]), vec![a]);
  }

  #[test]
  fn test_threshold_is_inclusive() {
    // 交集 7x10 = 70，较小框面积 100，比例恰好 0.7
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(3.0, 0.0, 13.0, 10.0);
    assert!(a.is_overlapping(&b, OVERLAP_THRESHOLD));
    assert!(filter_boxes(&[a], &[b]).is_empty());

    // 交集 6x10 = 60，比例 0.6
    let c = BBox::new(4.0, 0.0, 14.0, 10.0);
    assert!(!a.is_overlapping(&c, OVERLAP_THRESHOLD));
    assert_eq!(filter_boxes(&[a], &[c]), vec![a]);
  }

  #[test]
  fn test_small_box_inside_large_box_counts_as_overlap() {
    // 比例以较小的框为准
    let small = BBox::new(10.0, 10.0, 20.0, 20.0);
    let large = BBox::new(0.0, 0.0, 100.0, 100.0);
    assert!(filter_boxes(&[small], &[large]).is_empty());
    assert!(filter_boxes(&[large], &[small]).is_empty());
  }

  #[test]
  fn test_any_other_box_removes_and_order_is_kept() {
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(20.0, 0.0, 30.0, 10.0);
    let c = BBox::new(40.0, 0.0, 50.0, 10.0);
    let speakers = [BBox::new(100.0, 100.0, 110.0, 110.0), BBox::new(20.0, 0.0, 30.0, 10.0)];
    assert_eq!(filter_boxes(&[a, b, c], &speakers), vec![a, c]);
    assert_eq!(filter_boxes(&[a, b, c], &[]), vec![a, b, c]);
  }

  #[test]
  fn test_degenerate_box_is_removed() {
    // 零面积的框与任何框都算重叠
    let point = BBox::new(50.0, 50.0, 50.0, 50.0);
    let far = BBox::new(0.0, 0.0, 1.0, 1.0);
    assert!(point.is_overlapping(&far, OVERLAP_THRESHOLD));
    assert!(filter_boxes(&[point], &[far]).is_empty());
  }

  #[test]
  fn test_clamp_to_image() {
    let bbox = BBox::new(-3.2, 1.5, 12.1, 40.0);
    assert_eq!(bbox.clamp_to(10, 20), Some((0, 1, 10, 20)));
    assert_eq!(BBox::new(11.0, 0.0, 15.0, 5.0).clamp_to(10, 20), None);
  }

  #[test]
  fn test_serializes_as_plain_array() {
    let bbox = BBox::new(1.0, 2.0, 3.0, 4.0);
    assert_eq!(serde_json::to_string(&bbox).unwrap(), "[1.0,2.0,3.0,4.0]");
  }
}
