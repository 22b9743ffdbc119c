// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/store.rs - 原始输出缓存
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

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, error};

use crate::model::{FoldEpoch, ModelError, ModelRun, RawPrediction};

#[derive(Error, Debug)]
pub enum CacheError {
  #[error("缓存的原始输出不存在: {0}")]
  Missing(PathBuf),
  #[error("缓存的原始输出无法解析 {path}: {source}")]
  Malformed {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("缓存的原始输出不一致 {path}: {source}")]
  Inconsistent {
    path: PathBuf,
    #[source]
    source: ModelError,
  },
  #[error("原始输出的 {field} 含有非有限值, 拒绝写入 {path}")]
  NonFinite { path: PathBuf, field: &'static str },
  #[error("缓存的原始输出无法聚合: {0}")]
  Model(#[from] ModelError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// JSON 无法表示 inf 与 NaN，返回第一个含有非有限值的字段
fn non_finite_field(raw: &RawPrediction) -> Option<&'static str> {
  fn finite(values: &[f32]) -> bool {
    values.iter().all(|v| v.is_finite())
  }

  if !raw.regression.iter().all(|d| finite(d)) {
    Some("regression")
  } else if !finite(&raw.classification) {
    Some("classification")
  } else if !finite(&raw.global.0) {
    Some("global")
  } else if !raw.anchors.iter().all(|a| finite(a)) {
    Some("anchors")
  } else {
    None
  }
}

/// 按 `(模型, 运行标签, 折, 轮次, 图像)` 存取单张图像的原始输出
///
/// 目录结构为 `{root}/{model}[_{run}]_fold_{fold}/{epoch:03}/{image_id}.json`。
#[derive(Debug, Clone)]
pub struct RawPredictionStore {
  root: PathBuf,
  run: ModelRun,
}

impl RawPredictionStore {
  pub fn new(root: impl Into<PathBuf>, run: ModelRun) -> Self {
    RawPredictionStore {
      root: root.into(),
      run,
    }
  }

  pub fn run(&self) -> &ModelRun {
    &self.run
  }

  pub fn path(&self, key: FoldEpoch, image_id: &str) -> PathBuf {
    self
      .root
      .join(self.run.fold_dir(key.fold))
      .join(format!("{:03}", key.epoch))
      .join(format!("{image_id}.json"))
  }

  pub fn save(
    &self,
    key: FoldEpoch,
    image_id: &str,
    raw: &RawPrediction,
  ) -> Result<PathBuf, CacheError> {
    let path = self.path(key, image_id);
    if let Some(field) = non_finite_field(raw) {
      error!("{} 的 {} 含有非有限值", image_id, field);
      return Err(CacheError::NonFinite { path, field });
    }
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer(&mut writer, raw).map_err(|source| CacheError::Malformed {
      path: path.clone(),
      source,
    })?;
    writer.flush()?;

    debug!("写入原始输出: {}", path.display());
    Ok(path)
  }

  pub fn load(&self, key: FoldEpoch, image_id: &str) -> Result<RawPrediction, CacheError> {
    let path = self.path(key, image_id);
    let data = match std::fs::read(&path) {
      Ok(data) => data,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        error!("缓存的原始输出不存在: {}", path.display());
        return Err(CacheError::Missing(path));
      }
      Err(e) => return Err(e.into()),
    };

    let raw: RawPrediction = serde_json::from_slice(&data).map_err(|source| {
      error!("无法解析缓存的原始输出 {}: {}", path.display(), source);
      CacheError::Malformed {
        path: path.clone(),
        source,
      }
    })?;

    if let Err(source) = raw.validate() {
      return Err(CacheError::Inconsistent { path, source });
    }

    Ok(raw)
  }
}
