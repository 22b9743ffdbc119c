// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/model/rknn.rs - RKNN 上的 RetinaNet 检测器
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

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::AsNhwcFrame,
  model::{
    AnchorGrid, CheckpointError, Detector, DetectorLoader, GLOBAL_CLASS_NUM, GlobalScores,
    ModelError, RawPrediction, RegressionDelta,
  },
  query_value,
};

const RETINA_NUM_INPUTS: u32 = 1;
/// 回归、逐框分类、全图分类
const RETINA_NUM_OUTPUTS: u32 = 3;
const RETINA_DEFAULT_SIZE: u32 = 512;
const RETINA_DEFAULT_CLASSES: usize = 1;

const OUTPUT_REGRESSION: usize = 0;
const OUTPUT_CLASSIFICATION: usize = 1;
const OUTPUT_GLOBAL: usize = 2;

#[derive(Error, Debug)]
pub enum RknnDetectorError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("输出张量 {index} 长度为 {actual}, 期望 {expected}")]
  OutputShape {
    index: usize,
    expected: usize,
    actual: usize,
  },
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error(transparent)]
  Checkpoint(#[from] CheckpointError),
}

impl From<rknpu::Error> for RknnDetectorError {
  fn from(err: rknpu::Error) -> Self {
    RknnDetectorError::RknnError(err)
  }
}

impl RknnDetectorError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnDetectorError::ModelInvalid(msg.to_string(), e)
  }
}

/// `rknn:///path/to/model.rknn?size=512&classes=1`
pub struct RetinaRknnBuilder {
  model_path: PathBuf,
  size: u32,
  num_classes: usize,
  flags: InitFlags,
}

impl FromUrlWithScheme for RetinaRknnBuilder {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for RetinaRknnBuilder {
  type Error = RknnDetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RknnDetectorError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(RetinaRknnBuilder::new(url.path())
      .size(query_value(url, "size").unwrap_or(RETINA_DEFAULT_SIZE))
      .num_classes(query_value(url, "classes").unwrap_or(RETINA_DEFAULT_CLASSES)))
  }
}

impl RetinaRknnBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    RetinaRknnBuilder {
      model_path: model_path.into(),
      size: RETINA_DEFAULT_SIZE,
      num_classes: RETINA_DEFAULT_CLASSES,
      flags: InitFlags::default(),
    }
  }

  pub fn size(mut self, size: u32) -> Self {
    self.size = size;
    self
  }

  pub fn num_classes(mut self, num_classes: usize) -> Self {
    self.num_classes = num_classes;
    self
  }

  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn build<Frame>(self) -> Result<RetinaRknn<Frame>, RknnDetectorError> {
    info!("加载模型文件: {}", self.model_path.display());
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, self.flags)?;

    let num_inputs = context
      .num_inputs()
      .map_err(|e| RknnDetectorError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| RknnDetectorError::invalid("无法获取输出数量", e))?;

    if num_inputs != RETINA_NUM_INPUTS || num_outputs != RETINA_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        RETINA_NUM_INPUTS, RETINA_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(RknnDetectorError::invalid(&msg, rknpu::Error::InvalidModel));
    }

    // 锚框只与输入尺寸有关，加载时生成一次
    let anchors = AnchorGrid::default();
    let side = self.size as usize;
    anchors.anchors(side, side)?;
    info!("模型加载完成, 输入尺寸 {}", self.size);

    Ok(RetinaRknn {
      context,
      size: self.size,
      num_classes: self.num_classes,
      anchors,
      _phantom: PhantomData,
    })
  }
}

pub struct RetinaRknn<Frame> {
  context: Context,
  size: u32,
  num_classes: usize,
  anchors: AnchorGrid,
  _phantom: PhantomData<Frame>,
}

fn expect_len(index: usize, data: &[f32], expected: usize) -> Result<(), RknnDetectorError> {
  if data.len() != expected {
    error!("输出张量 {} 长度为 {}, 期望 {}", index, data.len(), expected);
    return Err(RknnDetectorError::OutputShape {
      index,
      expected,
      actual: data.len(),
    });
  }
  Ok(())
}

impl<Frame: AsNhwcFrame> Detector for RetinaRknn<Frame> {
  type Input = Frame;
  type Error = RknnDetectorError;

  fn input_size(&self) -> u32 {
    self.size
  }

  fn infer_raw(&self, input: &Frame) -> Result<RawPrediction, RknnDetectorError> {
    let side = self.size as usize;
    let anchors = self.anchors.anchors(side, side)?;

    debug!("设置模型输入");
    self
      .context
      .set_input(0, input.as_nhwc(), TensorFormat::NHWC, TensorType::UInt8)?;
    debug!("执行模型推理");
    self.context.run()?;
    let output = self.context.get_outputs()?;

    let count = anchors.len();
    let regression = output.get_f32(OUTPUT_REGRESSION)?;
    expect_len(OUTPUT_REGRESSION, regression, count * 4)?;
    let classification = output.get_f32(OUTPUT_CLASSIFICATION)?;
    expect_len(OUTPUT_CLASSIFICATION, classification, count * self.num_classes)?;
    let global = output.get_f32(OUTPUT_GLOBAL)?;
    expect_len(OUTPUT_GLOBAL, global, GLOBAL_CLASS_NUM)?;

    let regression: Vec<RegressionDelta> = regression
      .chunks_exact(4)
      .map(|d| [d[0], d[1], d[2], d[3]])
      .collect();

    Ok(RawPrediction {
      regression,
      classification: classification.to_vec(),
      num_classes: self.num_classes,
      global: GlobalScores::from_log_probs([global[0], global[1], global[2]]),
      anchors,
    })
  }
}

/// 按固定的输入尺寸与类别数从 `.rknn` 检查点构建检测器
pub struct RetinaRknnLoader<Frame> {
  size: u32,
  num_classes: usize,
  _phantom: PhantomData<Frame>,
}

impl<Frame> RetinaRknnLoader<Frame> {
  pub fn new(size: u32, num_classes: usize) -> Self {
    RetinaRknnLoader {
      size,
      num_classes,
      _phantom: PhantomData,
    }
  }
}

impl<Frame: AsNhwcFrame> DetectorLoader for RetinaRknnLoader<Frame> {
  type Detector = RetinaRknn<Frame>;
  type Error = RknnDetectorError;

  fn load(&self, checkpoint: &Path) -> Result<RetinaRknn<Frame>, RknnDetectorError> {
    RetinaRknnBuilder::new(checkpoint)
      .size(self.size)
      .num_classes(self.num_classes)
      .build()
  }
}
