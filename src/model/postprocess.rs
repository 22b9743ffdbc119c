// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/postprocess.rs - 解码、裁剪与抑制
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

use tracing::debug;

use crate::model::{
  BBox, BoxCoder, DetectItem, ModelError, RawPrediction, Suppressed,
  box_coder::clip_box,
  nms::{DEFAULT_IOU_THRESHOLD, SCORE_FLOOR, suppress},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostProcessor {
  pub coder: BoxCoder,
  pub iou_threshold: f32,
  pub score_floor: f32,
}

impl Default for PostProcessor {
  fn default() -> Self {
    PostProcessor {
      coder: BoxCoder::default(),
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      score_floor: SCORE_FLOOR,
    }
  }
}

impl PostProcessor {
  pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.iou_threshold = iou_threshold;
    self
  }

  /// 把一份原始输出变为抑制后的检测框
  ///
  /// 只有最高类别分数高于 `score_floor` 的锚框会被解码和参与抑制，
  /// 结果与对全部锚框解码后再过滤相同。
  pub fn process(
    &self,
    raw: &RawPrediction,
    height: usize,
    width: usize,
  ) -> Result<Suppressed, ModelError> {
    if height == 0 || width == 0 {
      return Err(ModelError::InvalidDimensions { height, width });
    }
    raw.validate()?;

    let best = raw.best_scores();
    let candidates: Vec<usize> = best
      .iter()
      .enumerate()
      .filter(|(_, (score, _))| *score > self.score_floor)
      .map(|(i, _)| i)
      .collect();

    if candidates.is_empty() {
      debug!("没有高于 {} 的候选框", self.score_floor);
      return Ok(Suppressed {
        items: Box::new([]),
        global: raw.global,
      });
    }

    let boxes: Vec<BBox> = candidates
      .iter()
      .map(|&i| {
        let decoded = self.coder.decode_single(&raw.anchors[i], &raw.regression[i]);
        clip_box(&decoded, width as f32, height as f32)
      })
      .collect();
    let scores: Vec<f32> = candidates.iter().map(|&i| best[i].0).collect();

    let keep = suppress(&boxes, &scores, self.iou_threshold);
    debug!("候选框 {} 个, 抑制后保留 {} 个", candidates.len(), keep.len());

    let items: Vec<DetectItem> = keep
      .into_iter()
      .map(|k| DetectItem {
        class_id: best[candidates[k]].1,
        score: scores[k],
        bbox: boxes[k],
      })
      .collect();

    Ok(Suppressed {
      items: items.into_boxed_slice(),
      global: raw.global,
    })
  }
}
