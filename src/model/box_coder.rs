// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/box_coder.rs - 回归输出解码
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

use crate::model::{Anchor, BBox, ModelError, RegressionDelta};

/// 把相对锚框的回归量解码为图像坐标
///
/// 每个分量先除以对应权重，`(10, 10, 5, 5)` 即训练时的标准差
/// `(0.1, 0.1, 0.2, 0.2)`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
  pub weights: (f32, f32, f32, f32),
}

impl Default for BoxCoder {
  fn default() -> Self {
    BoxCoder::new((10.0, 10.0, 5.0, 5.0))
  }
}

impl BoxCoder {
  /// 不做归一化的解码
  pub const UNIT: BoxCoder = BoxCoder {
    weights: (1.0, 1.0, 1.0, 1.0),
  };

  pub fn new(weights: (f32, f32, f32, f32)) -> Self {
    BoxCoder { weights }
  }

  pub fn decode_single(&self, anchor: &Anchor, delta: &RegressionDelta) -> BBox {
    let width = anchor[2] - anchor[0];
    let height = anchor[3] - anchor[1];
    let ctr_x = anchor[0] + 0.5 * width;
    let ctr_y = anchor[1] + 0.5 * height;

    let (wx, wy, ww, wh) = self.weights;
    let dx = delta[0] / wx;
    let dy = delta[1] / wy;
    let dw = delta[2] / ww;
    let dh = delta[3] / wh;

    let pred_ctr_x = ctr_x + dx * width;
    let pred_ctr_y = ctr_y + dy * height;
    let pred_w = dw.exp() * width;
    let pred_h = dh.exp() * height;

    [
      pred_ctr_x - 0.5 * pred_w,
      pred_ctr_y - 0.5 * pred_h,
      pred_ctr_x + 0.5 * pred_w,
      pred_ctr_y + 0.5 * pred_h,
    ]
  }

  pub fn decode(
    &self,
    anchors: &[Anchor],
    deltas: &[RegressionDelta],
  ) -> Result<Vec<BBox>, ModelError> {
    if anchors.len() != deltas.len() {
      return Err(ModelError::RegressionLengthMismatch {
        anchors: anchors.len(),
        deltas: deltas.len(),
      });
    }

    Ok(
      anchors
        .iter()
        .zip(deltas)
        .map(|(anchor, delta)| self.decode_single(anchor, delta))
        .collect(),
    )
  }
}

/// 把检测框裁剪到 `[0, width] x [0, height]`
///
/// `max`/`min` 遇到 NaN 时取另一个操作数，所以 NaN 坐标也会落在边界内。
pub fn clip_box(bbox: &BBox, width: f32, height: f32) -> BBox {
  let x1 = bbox[0].max(0.0).min(width);
  let y1 = bbox[1].max(0.0).min(height);
  let x2 = bbox[2].min(width).max(x1);
  let y2 = bbox[3].min(height).max(y1);
  [x1, y1, x2, y2]
}

pub fn clip_boxes(boxes: &mut [BBox], width: f32, height: f32) {
  for bbox in boxes.iter_mut() {
    *bbox = clip_box(bbox, width, height);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zero_delta_is_identity() {
    let anchor = [10.0, 20.0, 50.0, 40.0];
    for coder in [BoxCoder::default(), BoxCoder::UNIT] {
      assert_eq!(coder.decode_single(&anchor, &[0.0; 4]), anchor);
    }
  }

  #[test]
  fn unit_coder_follows_center_size_formula() {
    let anchor = [0.0, 0.0, 10.0, 20.0];
    let delta = [0.5, -0.25, 2f32.ln(), 0.0];
    let bbox = BoxCoder::UNIT.decode_single(&anchor, &delta);
    // 中心 (5 + 0.5*10, 10 - 0.25*20) = (10, 5)，尺寸 (20, 20)
    for (x, y) in bbox.iter().zip([0.0, -5.0, 20.0, 15.0].iter()) {
      assert!((x - y).abs() < 1e-4, "{bbox:?}");
    }
  }

  #[test]
  fn default_weights_scale_deltas() {
    let anchor = [0.0, 0.0, 10.0, 10.0];
    let a = BoxCoder::default().decode_single(&anchor, &[1.0, 1.0, 0.0, 0.0]);
    let b = BoxCoder::UNIT.decode_single(&anchor, &[0.1, 0.1, 0.0, 0.0]);
    for (x, y) in a.iter().zip(b.iter()) {
      assert!((x - y).abs() < 1e-5);
    }
  }

  #[test]
  fn decode_rejects_length_mismatch() {
    let result = BoxCoder::default().decode(&[[0.0, 0.0, 1.0, 1.0]], &[]);
    assert_eq!(
      result,
      Err(ModelError::RegressionLengthMismatch {
        anchors: 1,
        deltas: 0
      })
    );
  }

  #[test]
  fn clip_keeps_boxes_in_bounds() {
    assert_eq!(clip_box(&[-5.0, -1.0, 70.0, 30.0], 64.0, 64.0), [0.0, 0.0, 64.0, 30.0]);
    assert_eq!(clip_box(&[80.0, 10.0, 90.0, 20.0], 64.0, 64.0), [64.0, 10.0, 64.0, 20.0]);
    assert_eq!(clip_box(&[f32::NAN, 1.0, f32::NAN, 2.0], 64.0, 64.0), [0.0, 1.0, 64.0, 2.0]);
  }

  #[test]
  fn extreme_delta_collapses_to_image() {
    let bbox = BoxCoder::UNIT.decode_single(&[10.0, 10.0, 20.0, 20.0], &[0.0, 0.0, 200.0, 200.0]);
    assert_eq!(clip_box(&bbox, 64.0, 64.0), [0.0, 0.0, 64.0, 64.0]);
  }
}
