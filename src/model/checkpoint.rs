// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/checkpoint.rs - 检查点定位与加载
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use crate::model::Detector;

pub const CHECKPOINT_EXTENSION: &str = "rknn";

#[derive(Error, Debug)]
pub enum CheckpointError {
  #[error("检查点不存在: {0}")]
  NotFound(PathBuf),
}

/// 一次训练的标识：模型名加可选的运行标签
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRun {
  pub model: String,
  pub run: Option<String>,
}

impl ModelRun {
  pub fn new(model: impl Into<String>, run: Option<String>) -> Self {
    let run = run.filter(|r| !r.is_empty());
    ModelRun {
      model: model.into(),
      run,
    }
  }

  /// `{model}[_{run}]_fold_{fold}`
  pub fn fold_dir(&self, fold: u32) -> String {
    match &self.run {
      Some(run) => format!("{}_{}_fold_{}", self.model, run, fold),
      None => format!("{}_fold_{}", self.model, fold),
    }
  }
}

/// 单个训练折与轮次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FoldEpoch {
  pub fold: u32,
  pub epoch: u32,
}

impl FoldEpoch {
  /// 轮次为主序、折为次序
  pub fn grid(folds: &[u32], epochs: &[u32]) -> Vec<FoldEpoch> {
    epochs
      .iter()
      .flat_map(|&epoch| folds.iter().map(move |&fold| FoldEpoch { fold, epoch }))
      .collect()
  }
}

#[derive(Debug, Clone)]
pub struct CheckpointLocator {
  root: PathBuf,
  run: ModelRun,
}

impl CheckpointLocator {
  pub fn new(root: impl Into<PathBuf>, run: ModelRun) -> Self {
    CheckpointLocator {
      root: root.into(),
      run,
    }
  }

  pub fn run(&self) -> &ModelRun {
    &self.run
  }

  /// `{root}/{model}[_{run}]_fold_{fold}/{model}_{epoch:03}.{ext}`
  pub fn path(&self, key: FoldEpoch) -> PathBuf {
    self.root.join(self.run.fold_dir(key.fold)).join(format!(
      "{}_{:03}.{}",
      self.run.model, key.epoch, CHECKPOINT_EXTENSION
    ))
  }

  pub fn resolve(&self, key: FoldEpoch) -> Result<PathBuf, CheckpointError> {
    let path = self.path(key);
    if !path.is_file() {
      error!("检查点不存在: {}", path.display());
      return Err(CheckpointError::NotFound(path));
    }
    Ok(path)
  }
}

/// 把检查点文件变为可运行的检测器
pub trait DetectorLoader {
  type Detector: Detector;
  type Error: From<CheckpointError>;

  fn load(&self, checkpoint: &Path) -> Result<Self::Detector, Self::Error>;

  /// 依次加载多个检查点，只在开始时加载一次，供全部图像复用
  fn load_all(
    &self,
    locator: &CheckpointLocator,
    keys: &[FoldEpoch],
  ) -> Result<Vec<(FoldEpoch, Self::Detector)>, Self::Error> {
    let mut detectors = Vec::with_capacity(keys.len());
    for &key in keys {
      let path = locator.resolve(key)?;
      info!("加载检查点: {}", path.display());
      detectors.push((key, self.load(&path)?));
    }
    Ok(detectors)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fold_dir_includes_run_tag() {
    assert_eq!(ModelRun::new("se_resnext101", None).fold_dir(2), "se_resnext101_fold_2");
    assert_eq!(
      ModelRun::new("se_resnext101", Some("dr0".to_string())).fold_dir(0),
      "se_resnext101_dr0_fold_0"
    );
    assert_eq!(
      ModelRun::new("resnet34", Some(String::new())).fold_dir(1),
      "resnet34_fold_1"
    );
  }

  #[test]
  fn checkpoint_path_pads_epoch() {
    let locator = CheckpointLocator::new("checkpoints", ModelRun::new("resnet34", None));
    assert_eq!(
      locator.path(FoldEpoch { fold: 3, epoch: 7 }),
      PathBuf::from("checkpoints/resnet34_fold_3/resnet34_007.rknn")
    );
  }

  #[test]
  fn grid_is_epoch_major() {
    let keys = FoldEpoch::grid(&[0, 1], &[10, 12]);
    let pairs: Vec<(u32, u32)> = keys.iter().map(|k| (k.epoch, k.fold)).collect();
    assert_eq!(pairs, vec![(10, 0), (10, 1), (12, 0), (12, 1)]);
  }

  #[test]
  fn missing_checkpoint_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let locator = CheckpointLocator::new(dir.path(), ModelRun::new("resnet34", None));
    let err = locator.resolve(FoldEpoch { fold: 0, epoch: 1 }).unwrap_err();
    assert!(matches!(err, CheckpointError::NotFound(_)));
  }
}
