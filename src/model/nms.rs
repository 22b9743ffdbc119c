// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use crate::model::BBox;

/// 病灶之间很少重叠，所以抑制阈值取得很低
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.05;

/// 进入抑制前的最低分数，仅用于减少候选框数量，见 `PostProcessor`
pub const SCORE_FLOOR: f32 = 0.025;

pub fn area(bbox: &BBox) -> f32 {
  (bbox[2] - bbox[0]).max(0.0) * (bbox[3] - bbox[1]).max(0.0)
}

/// 计算两个边界框的 IoU，并集为零时返回 0
pub fn iou(a: &BBox, b: &BBox) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = area(a) + area(b) - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 贪心 NMS
///
/// 返回保留框的下标，按分数降序；分数相同时下标小者在前。
/// 与已保留框 IoU 大于 `iou_threshold` 的框被丢弃。
pub fn suppress(boxes: &[BBox], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
  debug_assert_eq!(boxes.len(), scores.len());
  let count = boxes.len().min(scores.len());

  let mut order: Vec<usize> = (0..count).collect();
  // 稳定排序保证同分时原始顺序不变
  order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

  let mut suppressed = vec![false; count];
  let mut keep = Vec::new();

  for (position, &current) in order.iter().enumerate() {
    if suppressed[current] {
      continue;
    }
    keep.push(current);

    for &other in &order[position + 1..] {
      if !suppressed[other] && iou(&boxes[current], &boxes[other]) > iou_threshold {
        suppressed[other] = true;
      }
    }
  }

  keep
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_of_identical_boxes_is_one() {
    let bbox = [0.0, 0.0, 10.0, 10.0];
    assert_eq!(iou(&bbox, &bbox), 1.0);
  }

  #[test]
  fn iou_of_half_overlap() {
    let a = [0.0, 0.0, 10.0, 10.0];
    let b = [5.0, 0.0, 15.0, 10.0];
    assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
  }

  #[test]
  fn zero_area_boxes_have_zero_iou() {
    let point = [3.0, 3.0, 3.0, 3.0];
    assert_eq!(iou(&point, &point), 0.0);
    assert_eq!(iou(&point, &[0.0, 0.0, 10.0, 10.0]), 0.0);
  }

  #[test]
  fn suppresses_overlapping_lower_scores() {
    let boxes = [
      [10.0, 10.0, 50.0, 50.0],
      [15.0, 15.0, 55.0, 55.0],
      [100.0, 100.0, 150.0, 150.0],
    ];
    let scores = [0.9, 0.8, 0.95];
    assert_eq!(suppress(&boxes, &scores, 0.5), vec![2, 0]);
  }

  #[test]
  fn ties_keep_earlier_index() {
    let boxes = [
      [0.0, 0.0, 10.0, 10.0],
      [1.0, 1.0, 11.0, 11.0],
      [50.0, 50.0, 60.0, 60.0],
    ];
    let scores = [0.5, 0.5, 0.5];
    assert_eq!(suppress(&boxes, &scores, 0.05), vec![0, 2]);
  }

  #[test]
  fn threshold_is_strict() {
    let a = [0.0, 0.0, 10.0, 10.0];
    let b = [5.0, 0.0, 15.0, 10.0];
    let overlap = iou(&a, &b);
    assert_eq!(suppress(&[a, b], &[0.9, 0.8], overlap), vec![0, 1]);
  }

  #[test]
  fn empty_input_gives_empty_output() {
    assert!(suppress(&[], &[], 0.05).is_empty());
  }
}
