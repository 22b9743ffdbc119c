// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/aggregate.rs - 多折 / 多轮次原始输出聚合
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

use tracing::debug;

use crate::model::{GLOBAL_CLASS_NUM, GlobalScores, ModelError, RawPrediction, RegressionDelta};

/// 尺寸分量默认取第 10 百分位，结果偏向较小的框
pub const DEFAULT_SIZE_PERCENTILE: f32 = 10.0;

/// 回归输出中尺寸分量 `(dw, dh)` 的聚合方式；位置分量 `(dx, dy)` 总是取均值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeReduction {
  Mean,
  Percentile(f32),
}

impl Default for SizeReduction {
  fn default() -> Self {
    SizeReduction::Percentile(DEFAULT_SIZE_PERCENTILE)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PredictionAggregator {
  pub size_reduction: SizeReduction,
}

/// 线性插值百分位，与常见统计库的默认算法一致
///
/// `values` 会被原地排序，调用方需保证非空。
pub fn percentile(values: &mut [f64], q: f64) -> f64 {
  values.sort_by(f64::total_cmp);

  let last = values.len() - 1;
  let position = (q / 100.0).clamp(0.0, 1.0) * last as f64;
  let lower = position.floor() as usize;
  let upper = (lower + 1).min(last);
  let t = position - lower as f64;

  let (a, b) = (values[lower], values[upper]);
  let diff = b - a;
  if t >= 0.5 {
    b - diff * (1.0 - t)
  } else {
    a + diff * t
  }
}

fn mean(values: impl Iterator<Item = f32>, count: usize) -> f32 {
  (values.map(f64::from).sum::<f64>() / count as f64) as f32
}

impl PredictionAggregator {
  pub fn new(size_reduction: SizeReduction) -> Self {
    PredictionAggregator { size_reduction }
  }

  fn check_shapes(predictions: &[RawPrediction]) -> Result<(), ModelError> {
    let first = predictions.first().ok_or(ModelError::EmptyEnsemble)?;
    first.validate()?;

    for (member, prediction) in predictions.iter().enumerate().skip(1) {
      prediction.validate()?;

      let same_anchors = Arc::ptr_eq(&first.anchors, &prediction.anchors)
        || first.anchors == prediction.anchors;
      if !same_anchors {
        return Err(ModelError::AnchorMismatch { member });
      }

      if prediction.num_classes != first.num_classes
        || prediction.classification.len() != first.classification.len()
      {
        return Err(ModelError::ShapeMismatch { member });
      }
    }

    Ok(())
  }

  fn reduce_size(&self, samples: &mut [f64], count: usize) -> f32 {
    match self.size_reduction {
      SizeReduction::Mean => (samples.iter().sum::<f64>() / count as f64) as f32,
      SizeReduction::Percentile(q) => percentile(samples, f64::from(q)) as f32,
    }
  }

  /// 合并若干个共享同一组锚框的原始输出
  ///
  /// 位置分量、逐框分类和全图分类取均值，尺寸分量按 [`SizeReduction`]。
  pub fn aggregate(&self, predictions: &[RawPrediction]) -> Result<RawPrediction, ModelError> {
    Self::check_shapes(predictions)?;
    let first = &predictions[0];
    let count = predictions.len();

    let mut samples = vec![0f64; count];
    let regression: Vec<RegressionDelta> = (0..first.regression.len())
      .map(|i| {
        let dx = mean(predictions.iter().map(|p| p.regression[i][0]), count);
        let dy = mean(predictions.iter().map(|p| p.regression[i][1]), count);

        let mut size = [0f32; 2];
        for (k, value) in size.iter_mut().enumerate() {
          for (sample, p) in samples.iter_mut().zip(predictions) {
            *sample = f64::from(p.regression[i][2 + k]);
          }
          *value = self.reduce_size(&mut samples, count);
        }

        [dx, dy, size[0], size[1]]
      })
      .collect();

    let classification: Vec<f32> = (0..first.classification.len())
      .map(|i| mean(predictions.iter().map(|p| p.classification[i]), count))
      .collect();

    let mut global = [0f32; GLOBAL_CLASS_NUM];
    for (c, value) in global.iter_mut().enumerate() {
      *value = mean(predictions.iter().map(|p| p.global.probs()[c]), count);
    }

    debug!(
      "聚合 {} 个模型输出, 锚框 {} 个, 尺寸聚合方式 {:?}",
      count,
      first.anchors.len(),
      self.size_reduction
    );

    Ok(RawPrediction {
      regression,
      classification,
      num_classes: first.num_classes,
      global: GlobalScores(global),
      anchors: Arc::clone(&first.anchors),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn prediction(anchors: &Arc<[[f32; 4]]>, delta: [f32; 4], score: f32, global: [f32; 3]) -> RawPrediction {
    RawPrediction {
      regression: vec![delta; anchors.len()],
      classification: vec![score; anchors.len()],
      num_classes: 1,
      global: GlobalScores(global),
      anchors: Arc::clone(anchors),
    }
  }

  fn anchors() -> Arc<[[f32; 4]]> {
    Arc::from(vec![[0.0, 0.0, 8.0, 8.0], [4.0, 4.0, 12.0, 12.0]])
  }

  #[test]
  fn percentile_matches_linear_interpolation() {
    let mut values: Vec<f64> = (1..=10).map(|v| f64::from(v) * 10.0).collect();
    assert!((percentile(&mut values, 10.0) - 19.0).abs() < 1e-9);
    assert!((percentile(&mut values, 50.0) - 55.0).abs() < 1e-9);
    assert_eq!(percentile(&mut values, 0.0), 10.0);
    assert_eq!(percentile(&mut values, 100.0), 100.0);
  }

  #[test]
  fn percentile_sorts_input() {
    let mut values = vec![30.0, 10.0, 20.0];
    assert_eq!(percentile(&mut values, 50.0), 20.0);
  }

  #[test]
  fn single_prediction_is_unchanged() {
    let anchors = anchors();
    let p = prediction(&anchors, [0.1, -0.2, 0.3, -0.4], 0.7, [0.1, 0.2, 0.7]);
    let aggregated = PredictionAggregator::default().aggregate(&[p.clone()]).unwrap();
    assert_eq!(aggregated, p);
  }

  #[test]
  fn identical_copies_are_unchanged() {
    let anchors = anchors();
    let p = prediction(&anchors, [0.1, -0.2, 0.3, -0.4], 0.7, [0.1, 0.2, 0.7]);
    let copies = vec![p.clone(); 5];
    for reduction in [SizeReduction::default(), SizeReduction::Mean] {
      let aggregated = PredictionAggregator::new(reduction).aggregate(&copies).unwrap();
      assert_eq!(aggregated, p);
    }
  }

  #[test]
  fn position_mean_and_size_percentile() {
    let anchors = anchors();
    let predictions: Vec<RawPrediction> = (1..=10)
      .map(|v| {
        let v = v as f32;
        prediction(&anchors, [v, -v, v * 10.0, v * 10.0], v / 10.0, [0.0, 0.0, v / 10.0])
      })
      .collect();

    let aggregated = PredictionAggregator::default().aggregate(&predictions).unwrap();
    let [dx, dy, dw, dh] = aggregated.regression[0];
    assert!((dx - 5.5).abs() < 1e-6);
    assert!((dy + 5.5).abs() < 1e-6);
    assert!((dw - 19.0).abs() < 1e-5);
    assert!((dh - 19.0).abs() < 1e-5);
    assert!((aggregated.classification[1] - 0.55).abs() < 1e-6);
    assert!((aggregated.global.probs()[2] - 0.55).abs() < 1e-6);
  }

  #[test]
  fn mean_reduction_averages_sizes() {
    let anchors = anchors();
    let predictions = vec![
      prediction(&anchors, [0.0, 0.0, 1.0, 3.0], 0.5, [0.0; 3]),
      prediction(&anchors, [0.0, 0.0, 2.0, 5.0], 0.5, [0.0; 3]),
    ];
    let aggregated = PredictionAggregator::new(SizeReduction::Mean)
      .aggregate(&predictions)
      .unwrap();
    assert_eq!(aggregated.regression[0], [0.0, 0.0, 1.5, 4.0]);
  }

  #[test]
  fn mismatched_anchors_fail_fast() {
    let a = prediction(&anchors(), [0.0; 4], 0.5, [0.0; 3]);
    let other: Arc<[[f32; 4]]> = Arc::from(vec![[0.0, 0.0, 8.0, 8.0], [4.0, 4.0, 12.0, 13.0]]);
    let b = prediction(&other, [0.0; 4], 0.5, [0.0; 3]);
    assert_eq!(
      PredictionAggregator::default().aggregate(&[a, b]),
      Err(ModelError::AnchorMismatch { member: 1 })
    );
  }

  #[test]
  fn empty_input_is_an_error() {
    assert_eq!(
      PredictionAggregator::default().aggregate(&[]),
      Err(ModelError::EmptyEnsemble)
    );
  }
}
