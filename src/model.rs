// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model.rs - 模型
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

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod aggregate;
pub mod anchor;
pub mod box_coder;
pub mod checkpoint;
pub mod ensemble;
pub mod fusion;
pub mod nms;
pub mod postprocess;
#[cfg(feature = "rknn")]
mod rknn;

pub use self::aggregate::{PredictionAggregator, SizeReduction};
pub use self::anchor::{AnchorConfig, AnchorGrid};
pub use self::box_coder::BoxCoder;
pub use self::checkpoint::{CheckpointError, CheckpointLocator, DetectorLoader, FoldEpoch, ModelRun};
pub use self::ensemble::{CachedEnsemble, Ensemble};
pub use self::fusion::{FusionMode, ScoreFusion};
pub use self::postprocess::PostProcessor;
#[cfg(feature = "rknn")]
pub use self::rknn::{RetinaRknn, RetinaRknnBuilder, RetinaRknnLoader, RknnDetectorError};

/// 边界框 `[x_min, y_min, x_max, y_max]`
pub type BBox = [f32; 4];

/// 锚框，与 [`BBox`] 同为角点形式
pub type Anchor = BBox;

/// 回归输出 `[dx, dy, dw, dh]`
pub type RegressionDelta = [f32; 4];

/// 全图分类的类别数：阴性 / 不确定 / 阳性
pub const GLOBAL_CLASS_NUM: usize = 3;

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
  #[error("输入尺寸无效: {height}x{width}")]
  InvalidDimensions { height: usize, width: usize },
  #[error("回归输出数量 {deltas} 与锚框数量 {anchors} 不一致")]
  RegressionLengthMismatch { anchors: usize, deltas: usize },
  #[error("分类输出长度不匹配: 期望 {expected}, 实际 {actual}")]
  ClassificationLengthMismatch { expected: usize, actual: usize },
  #[error("第 {member} 个模型的锚框与第 0 个模型不一致")]
  AnchorMismatch { member: usize },
  #[error("第 {member} 个模型的输出形状与第 0 个模型不一致")]
  ShapeMismatch { member: usize },
  #[error("没有可聚合的模型输出")]
  EmptyEnsemble,
}

/// 全图分类概率
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalScores(pub [f32; GLOBAL_CLASS_NUM]);

impl GlobalScores {
  /// 网络的全图分类头输出 log-softmax，这里还原为概率
  pub fn from_log_probs(log_probs: [f32; GLOBAL_CLASS_NUM]) -> Self {
    GlobalScores(log_probs.map(f32::exp))
  }

  pub fn probs(&self) -> &[f32; GLOBAL_CLASS_NUM] {
    &self.0
  }
}

/// 单个模型对单张图像的原始输出
///
/// `regression`、`anchors` 与 `classification` 的每 `num_classes` 个元素
/// 按下标一一对应，顺序由 [`AnchorGrid`] 决定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
  pub regression: Vec<RegressionDelta>,
  pub classification: Vec<f32>,
  pub num_classes: usize,
  pub global: GlobalScores,
  pub anchors: Arc<[Anchor]>,
}

impl RawPrediction {
  /// 分类输出为空时视为“无检测”，不是错误
  pub fn has_scores(&self) -> bool {
    self.num_classes > 0 && !self.classification.is_empty()
  }

  pub fn validate(&self) -> Result<(), ModelError> {
    if self.regression.len() != self.anchors.len() {
      return Err(ModelError::RegressionLengthMismatch {
        anchors: self.anchors.len(),
        deltas: self.regression.len(),
      });
    }

    if self.has_scores() {
      let expected = self.anchors.len() * self.num_classes;
      if self.classification.len() != expected {
        return Err(ModelError::ClassificationLengthMismatch {
          expected,
          actual: self.classification.len(),
        });
      }
    }

    Ok(())
  }

  /// 每个锚框的最高类别分数及其类别
  pub fn best_scores(&self) -> Vec<(f32, u32)> {
    if !self.has_scores() {
      return Vec::new();
    }

    self
      .classification
      .chunks_exact(self.num_classes)
      .map(|scores| {
        let mut best = (f32::MIN, 0u32);
        for (class_id, &score) in scores.iter().enumerate() {
          if score > best.0 {
            best = (score, class_id as u32);
          }
        }
        best
      })
      .collect()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: BBox,
}

/// 抑制后的检测结果，分数按降序排列
#[derive(Debug, Clone, PartialEq)]
pub struct Suppressed {
  pub items: Box<[DetectItem]>,
  pub global: GlobalScores,
}

/// 融合与过滤后的最终结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
  pub category: Option<f32>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

/// 检测能力：从输入得到原始输出，骨干网络与检测头对调用方不透明
pub trait Detector {
  type Input: ?Sized;
  type Error: From<ModelError>;

  /// 模型输入分辨率（方形）
  fn input_size(&self) -> u32;

  fn infer_raw(&self, input: &Self::Input) -> Result<RawPrediction, Self::Error>;

  /// 直接返回解码并抑制后的检测框
  fn detect(&self, input: &Self::Input, post: &PostProcessor) -> Result<Suppressed, Self::Error> {
    let raw = self.infer_raw(input)?;
    let size = self.input_size() as usize;
    Ok(post.process(&raw, size, size)?)
  }
}

impl<D: Detector + ?Sized> Detector for &D {
  type Input = D::Input;
  type Error = D::Error;

  fn input_size(&self) -> u32 {
    (**self).input_size()
  }

  fn infer_raw(&self, input: &Self::Input) -> Result<RawPrediction, Self::Error> {
    (**self).infer_raw(input)
  }
}
