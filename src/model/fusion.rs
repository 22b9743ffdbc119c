// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/fusion.rs - 全图分类与检测分数融合
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

use crate::model::{DetectItem, DetectResult, GlobalScores, Suppressed};

/// 全图分类中的阳性类别
pub const POSITIVE_CLASS: usize = 2;
/// 全图分类中的第 0 类，以 [`CLASS_ZERO_WEIGHT`] 计入类别信号；第 1 类不参与
pub const CLASS_ZERO: usize = 0;
pub const CLASS_ZERO_WEIGHT: f32 = 0.1;

/// 低于最高分这一比例的检测框分数被置零
pub const RELATIVE_DAMPING: f32 = 0.5;

/// 使用全图类别信号时的放大系数
pub const GLOBAL_SIGNAL_SCALE: f32 = 10.0;
/// 不使用全图类别信号时的放大系数
pub const BOX_ONLY_SCALE: f32 = 5.0;

pub const DEFAULT_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMode {
  /// `score * category * 10 > threshold`
  #[default]
  Global,
  /// `score * 5 > threshold`
  BoxOnly,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreFusion {
  pub threshold: f32,
  pub mode: FusionMode,
}

impl Default for ScoreFusion {
  fn default() -> Self {
    ScoreFusion {
      threshold: DEFAULT_THRESHOLD,
      mode: FusionMode::Global,
    }
  }
}

impl ScoreFusion {
  pub fn new(threshold: f32, mode: FusionMode) -> Self {
    ScoreFusion { threshold, mode }
  }

  pub fn category_signal(global: &GlobalScores) -> f32 {
    let probs = global.probs();
    probs[POSITIVE_CLASS] + CLASS_ZERO_WEIGHT * probs[CLASS_ZERO]
  }

  /// 把低于 `RELATIVE_DAMPING * 最高分` 的分数置零
  pub fn damp(scores: &mut [f32]) {
    let Some(top) = scores.iter().copied().reduce(f32::max) else {
      return;
    };

    let floor = top * RELATIVE_DAMPING;
    for score in scores.iter_mut() {
      if *score < floor {
        *score = 0.0;
      }
    }
  }

  pub fn includes(&self, score: f32, category: f32) -> bool {
    match self.mode {
      FusionMode::Global => score * category * GLOBAL_SIGNAL_SCALE > self.threshold,
      FusionMode::BoxOnly => score * BOX_ONLY_SCALE > self.threshold,
    }
  }

  pub fn fuse(&self, suppressed: &Suppressed) -> DetectResult {
    let category = Self::category_signal(&suppressed.global);

    let mut scores: Vec<f32> = suppressed.items.iter().map(|item| item.score).collect();
    Self::damp(&mut scores);

    let items: Vec<DetectItem> = suppressed
      .items
      .iter()
      .zip(scores)
      .filter(|&(_, score)| self.includes(score, category))
      .map(|(item, score)| DetectItem {
        class_id: item.class_id,
        score,
        bbox: item.bbox,
      })
      .collect();

    debug!(
      "类别信号 {:.2}, 保留 {}/{} 个检测框",
      category,
      items.len(),
      suppressed.items.len()
    );

    DetectResult {
      items: items.into_boxed_slice(),
      category: Some(category),
    }
  }
}
