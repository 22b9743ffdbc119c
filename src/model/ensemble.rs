// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/ensemble.rs - 多折集成
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

use tracing::{debug, info};

use crate::model::{
  Detector, FoldEpoch, ModelError, PredictionAggregator, RawPrediction, SizeReduction,
};
use crate::store::{CacheError, RawPredictionStore};

/// 在同一输入上运行多个检测器并聚合其原始输出
///
/// 全部成员必须使用相同的输入分辨率，以保证锚框一致。
#[derive(Debug)]
pub struct Ensemble<D> {
  members: Vec<D>,
  aggregator: PredictionAggregator,
}

impl<D: Detector> Ensemble<D> {
  /// 在线集成默认对尺寸分量取均值
  pub fn new(members: Vec<D>) -> Result<Self, ModelError> {
    Self::with_aggregator(members, PredictionAggregator::new(SizeReduction::Mean))
  }

  pub fn with_aggregator(
    members: Vec<D>,
    aggregator: PredictionAggregator,
  ) -> Result<Self, ModelError> {
    let first = members.first().ok_or(ModelError::EmptyEnsemble)?;
    let size = first.input_size();
    if let Some(member) = members.iter().position(|m| m.input_size() != size) {
      return Err(ModelError::ShapeMismatch { member });
    }

    info!("集成 {} 个检测器, 输入尺寸 {}", members.len(), size);
    Ok(Ensemble {
      members,
      aggregator,
    })
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }
}

impl<D: Detector> Detector for Ensemble<D> {
  type Input = D::Input;
  type Error = D::Error;

  fn input_size(&self) -> u32 {
    self.members.first().map_or(0, |m| m.input_size())
  }

  fn infer_raw(&self, input: &Self::Input) -> Result<RawPrediction, Self::Error> {
    let outputs = self
      .members
      .iter()
      .map(|member| member.infer_raw(input))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(self.aggregator.aggregate(&outputs)?)
  }
}

/// 从缓存读取多个 (折, 轮次) 的原始输出并聚合，输入为图像编号
#[derive(Debug, Clone)]
pub struct CachedEnsemble {
  store: RawPredictionStore,
  keys: Vec<FoldEpoch>,
  aggregator: PredictionAggregator,
  input_size: u32,
}

impl CachedEnsemble {
  pub fn new(
    store: RawPredictionStore,
    keys: Vec<FoldEpoch>,
    aggregator: PredictionAggregator,
    input_size: u32,
  ) -> Result<Self, ModelError> {
    if keys.is_empty() {
      return Err(ModelError::EmptyEnsemble);
    }
    Ok(CachedEnsemble {
      store,
      keys,
      aggregator,
      input_size,
    })
  }

  pub fn keys(&self) -> &[FoldEpoch] {
    &self.keys
  }
}

impl Detector for CachedEnsemble {
  type Input = str;
  type Error = CacheError;

  fn input_size(&self) -> u32 {
    self.input_size
  }

  fn infer_raw(&self, image_id: &str) -> Result<RawPrediction, CacheError> {
    let outputs = self
      .keys
      .iter()
      .map(|&key| self.store.load(key, image_id))
      .collect::<Result<Vec<_>, _>>()?;
    debug!("{}: 读取 {} 份缓存输出", image_id, outputs.len());
    Ok(self.aggregator.aggregate(&outputs)?)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::model::{GlobalScores, ModelRun};

  #[derive(Debug)]
  struct Fixed {
    size: u32,
    raw: RawPrediction,
  }

  impl Detector for Fixed {
    type Input = ();
    type Error = ModelError;

    fn input_size(&self) -> u32 {
      self.size
    }

    fn infer_raw(&self, _: &()) -> Result<RawPrediction, ModelError> {
      Ok(self.raw.clone())
    }
  }

  fn raw(dw: f32, score: f32) -> RawPrediction {
    RawPrediction {
      regression: vec![[0.5, -0.5, dw, dw]],
      classification: vec![score],
      num_classes: 1,
      global: GlobalScores([0.2, 0.3, 0.5]),
      anchors: Arc::from(vec![[0.0, 0.0, 16.0, 16.0]]),
    }
  }

  #[test]
  fn members_are_averaged() {
    let ensemble = Ensemble::new(vec![
      Fixed { size: 64, raw: raw(1.0, 0.2) },
      Fixed { size: 64, raw: raw(3.0, 0.6) },
    ])
    .unwrap();
    let merged = ensemble.infer_raw(&()).unwrap();
    assert_eq!(merged.regression[0], [0.5, -0.5, 2.0, 2.0]);
    assert!((merged.classification[0] - 0.4).abs() < 1e-6);
  }

  #[test]
  fn mixed_input_sizes_are_rejected() {
    let err = Ensemble::new(vec![
      Fixed { size: 64, raw: raw(1.0, 0.2) },
      Fixed { size: 32, raw: raw(1.0, 0.2) },
    ])
    .unwrap_err();
    assert_eq!(err, ModelError::ShapeMismatch { member: 1 });
  }

  #[test]
  fn empty_ensemble_is_rejected() {
    assert_eq!(
      Ensemble::<Fixed>::new(Vec::new()).unwrap_err(),
      ModelError::EmptyEnsemble
    );
  }

  #[test]
  fn cached_members_use_size_percentile() {
    let dir = tempfile::tempdir().unwrap();
    let store = RawPredictionStore::new(dir.path(), ModelRun::new("resnet34", None));
    let keys = FoldEpoch::grid(&[0, 1, 2, 3], &[10]);
    for (i, &key) in keys.iter().enumerate() {
      store.save(key, "p", &raw(i as f32, 0.5)).unwrap();
    }

    let ensemble = CachedEnsemble::new(
      store,
      keys,
      PredictionAggregator::new(SizeReduction::Percentile(10.0)),
      64,
    )
    .unwrap();
    let merged = ensemble.infer_raw("p").unwrap();
    // 0, 1, 2, 3 的第 10 百分位数
    assert!((merged.regression[0][2] - 0.3).abs() < 1e-5);
    assert_eq!(merged.regression[0][0], 0.5);
  }

  #[test]
  fn missing_cached_member_fails_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let store = RawPredictionStore::new(dir.path(), ModelRun::new("resnet34", None));
    let keys = FoldEpoch::grid(&[0, 1], &[10]);
    store.save(keys[0], "p", &raw(1.0, 0.5)).unwrap();

    let ensemble =
      CachedEnsemble::new(store, keys, PredictionAggregator::default(), 64).unwrap();
    assert!(matches!(ensemble.infer_raw("p"), Err(CacheError::Missing(_))));
  }
}
