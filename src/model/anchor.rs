// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/anchor.rs - 锚框生成
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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::model::{Anchor, ModelError};

pub const DEFAULT_PYRAMID_LEVELS: [u32; 6] = [2, 3, 4, 5, 6, 7];
pub const DEFAULT_RATIOS: [f64; 3] = [0.5, 1.0, 2.0];

/// 金字塔各层的锚框参数
///
/// 第 `l` 层的步长为 `2^l`，基础尺寸为 `2^(l+2)`。
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorConfig {
  pub pyramid_levels: Vec<u32>,
  pub ratios: Vec<f64>,
  pub scales: Vec<f64>,
}

impl Default for AnchorConfig {
  fn default() -> Self {
    AnchorConfig {
      pyramid_levels: DEFAULT_PYRAMID_LEVELS.to_vec(),
      ratios: DEFAULT_RATIOS.to_vec(),
      scales: vec![1.0, 2f64.powf(1.0 / 3.0), 2f64.powf(2.0 / 3.0)],
    }
  }
}

impl AnchorConfig {
  pub fn anchors_per_cell(&self) -> usize {
    self.ratios.len() * self.scales.len()
  }

  fn stride(level: u32) -> usize {
    1usize << level
  }

  fn base_size(level: u32) -> f64 {
    (1u64 << (level + 2)) as f64
  }

  /// 以原点为中心的基础锚框，比例为主序、尺度为次序
  fn base_anchors(&self, base_size: f64) -> Vec<[f64; 4]> {
    let mut anchors = Vec::with_capacity(self.anchors_per_cell());
    for &ratio in &self.ratios {
      for &scale in &self.scales {
        let side = base_size * scale;
        let width = (side * side / ratio).sqrt();
        let height = width * ratio;
        anchors.push([-width * 0.5, -height * 0.5, width * 0.5, height * 0.5]);
      }
    }
    anchors
  }

  /// 生成全部锚框
  ///
  /// 顺序为：金字塔层、行、列、比例、尺度。下游按下标把回归与分类输出
  /// 和锚框对应起来，改变顺序会使结果错位。
  pub fn generate(&self, height: usize, width: usize) -> Result<Vec<Anchor>, ModelError> {
    if height == 0 || width == 0 {
      return Err(ModelError::InvalidDimensions { height, width });
    }

    let mut all = Vec::new();
    for &level in &self.pyramid_levels {
      let stride = Self::stride(level);
      let rows = height.div_ceil(stride);
      let cols = width.div_ceil(stride);
      let base = self.base_anchors(Self::base_size(level));

      all.reserve(rows * cols * base.len());
      for row in 0..rows {
        let shift_y = (row as f64 + 0.5) * stride as f64;
        for col in 0..cols {
          let shift_x = (col as f64 + 0.5) * stride as f64;
          for anchor in &base {
            all.push([
              (anchor[0] + shift_x) as f32,
              (anchor[1] + shift_y) as f32,
              (anchor[2] + shift_x) as f32,
              (anchor[3] + shift_y) as f32,
            ]);
          }
        }
      }
    }

    Ok(all)
  }
}

/// 按输入分辨率缓存锚框，各图像共享只读的同一组锚框
#[derive(Debug, Default)]
pub struct AnchorGrid {
  config: AnchorConfig,
  cache: Mutex<HashMap<(usize, usize), Arc<[Anchor]>>>,
}

impl AnchorGrid {
  pub fn new(config: AnchorConfig) -> Self {
    AnchorGrid {
      config,
      cache: Mutex::new(HashMap::new()),
    }
  }

  pub fn config(&self) -> &AnchorConfig {
    &self.config
  }

  pub fn anchors(&self, height: usize, width: usize) -> Result<Arc<[Anchor]>, ModelError> {
    let mut cache = self
      .cache
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(anchors) = cache.get(&(height, width)) {
      return Ok(Arc::clone(anchors));
    }

    let anchors: Arc<[Anchor]> = Arc::from(self.config.generate(height, width)?);
    debug!("生成 {}x{} 的锚框 {} 个", height, width, anchors.len());
    cache.insert((height, width), Arc::clone(&anchors));
    Ok(anchors)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn anchor_count_follows_level_shapes() {
    let config = AnchorConfig::default();
    let anchors = config.generate(64, 64).unwrap();
    // 16x16 + 8x8 + 4x4 + 2x2 + 1x1 + 1x1 个网格，每格 9 个锚框
    assert_eq!(anchors.len(), (256 + 64 + 16 + 4 + 1 + 1) * 9);
  }

  #[test]
  fn first_anchor_is_centered_on_first_cell() {
    let config = AnchorConfig::default();
    let anchors = config.generate(32, 32).unwrap();
    let [x1, y1, x2, y2] = anchors[0];
    // 第 2 层，步长 4，中心 (2, 2)；比例 0.5，尺度 1
    let width = (256.0f64 / 0.5).sqrt();
    let height = width * 0.5;
    assert!((x1 as f64 - (2.0 - width / 2.0)).abs() < 1e-4);
    assert!((y1 as f64 - (2.0 - height / 2.0)).abs() < 1e-4);
    assert!((x2 as f64 - (2.0 + width / 2.0)).abs() < 1e-4);
    assert!((y2 as f64 - (2.0 + height / 2.0)).abs() < 1e-4);
  }

  #[test]
  fn ordering_is_row_major_within_level() {
    let config = AnchorConfig {
      pyramid_levels: vec![3],
      ratios: vec![1.0],
      scales: vec![1.0],
    };
    let anchors = config.generate(16, 16).unwrap();
    let centers: Vec<(f32, f32)> = anchors
      .iter()
      .map(|a| ((a[0] + a[2]) / 2.0, (a[1] + a[3]) / 2.0))
      .collect();
    assert_eq!(centers, vec![(4.0, 4.0), (12.0, 4.0), (4.0, 12.0), (12.0, 12.0)]);
  }

  #[test]
  fn level_shape_rounds_up() {
    let config = AnchorConfig {
      pyramid_levels: vec![3],
      ratios: vec![1.0],
      scales: vec![1.0],
    };
    assert_eq!(config.generate(17, 9).unwrap().len(), 3 * 2);
  }

  #[test]
  fn zero_dimension_is_rejected() {
    let config = AnchorConfig::default();
    assert_eq!(
      config.generate(0, 32),
      Err(ModelError::InvalidDimensions {
        height: 0,
        width: 32
      })
    );
  }

  #[test]
  fn grid_reuses_cached_anchors() {
    let grid = AnchorGrid::default();
    let a = grid.anchors(32, 32).unwrap();
    let b = grid.anchors(32, 32).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
  }
}
