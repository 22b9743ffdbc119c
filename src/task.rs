// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/task.rs - 任务
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

use std::borrow::Borrow;
use std::io::{BufRead, Write};
use std::time::Instant;

use tracing::{debug, info};

use crate::{
  input::Sample,
  model::{DetectResult, Detector, FoldEpoch, PostProcessor, ScoreFusion},
  output::{
    DEFAULT_SHRINK_MARGIN, Render, SubmissionReader, SubmissionWriter, shrink_submission,
  },
  store::RawPredictionStore,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 逐张图像推理、抑制、融合，并把结果交给输出
///
/// 单检查点、多折在线集成与缓存集成只是检测器不同。
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmissionTask {
  post: PostProcessor,
  fusion: ScoreFusion,
}

impl SubmissionTask {
  pub fn new(post: PostProcessor, fusion: ScoreFusion) -> Self {
    SubmissionTask { post, fusion }
  }

  pub fn process<M: Detector>(
    &self,
    model: &M,
    input: &M::Input,
  ) -> Result<DetectResult, M::Error> {
    let suppressed = model.detect(input, &self.post)?;
    Ok(self.fusion.fuse(&suppressed))
  }
}

impl<F, IE, ME, RE, I, M, O> Task<I, M, O> for SubmissionTask
where
  IE: std::error::Error + Sync + Send + 'static,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Result<Sample<F>, IE>>,
  M: Detector<Error = ME>,
  F: Borrow<M::Input>,
  O: Render<DetectResult, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, mut output: O) -> Result<(), Self::Error> {
    info!("开始生成提交文件...");
    let start = Instant::now();
    let mut count = 0usize;

    for sample in input {
      let sample = sample?;
      let now = Instant::now();
      let result = self.process(&model, Borrow::<M::Input>::borrow(&sample.input))?;
      debug!("{}: 检测框 {} 个, 耗时 {:.2?}", sample.id, result.items.len(), now.elapsed());
      output.render_result(&sample.id, &result)?;
      count += 1;
    }

    output.finish()?;
    info!("处理 {} 张图像, 总耗时 {:.2?}", count, start.elapsed());
    Ok(())
  }
}

/// 对每个 (折, 轮次) 的检测器遍历全部图像，把原始输出写入缓存
///
/// 检测器只加载一次，输入需可重复遍历。
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpRawTask;

impl<F, IE, ME, I, D> Task<I, Vec<(FoldEpoch, D)>, &RawPredictionStore> for DumpRawTask
where
  IE: std::error::Error + Sync + Send + 'static,
  ME: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Result<Sample<F>, IE>> + Clone,
  D: Detector<Error = ME>,
  F: Borrow<D::Input>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: I,
    models: Vec<(FoldEpoch, D)>,
    store: &RawPredictionStore,
  ) -> Result<(), Self::Error> {
    info!("开始导出原始输出, 共 {} 个检查点", models.len());

    for (key, detector) in &models {
      info!("导出 fold {} epoch {:03}", key.fold, key.epoch);
      let now = Instant::now();
      let mut count = 0usize;
      for sample in input.clone() {
        let sample = sample?;
        let raw = detector.infer_raw(Borrow::<D::Input>::borrow(&sample.input))?;
        store.save(*key, &sample.id, &raw)?;
        count += 1;
      }
      info!("fold {} epoch {:03}: {} 张图像, 耗时 {:.2?}", key.fold, key.epoch, count, now.elapsed());
    }

    Ok(())
  }
}

/// 把已有提交文件中的框按比例收缩
#[derive(Debug, Clone, Copy)]
pub struct ShrinkTask {
  margin: f64,
}

impl Default for ShrinkTask {
  fn default() -> Self {
    ShrinkTask {
      margin: DEFAULT_SHRINK_MARGIN,
    }
  }
}

impl ShrinkTask {
  pub fn with_margin(mut self, margin: f64) -> Self {
    self.margin = margin;
    self
  }
}

impl<R: BufRead, W: Write> Task<SubmissionReader<R>, (), SubmissionWriter<W>> for ShrinkTask {
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: SubmissionReader<R>,
    _: (),
    mut output: SubmissionWriter<W>,
  ) -> Result<(), Self::Error> {
    info!("开始收缩提交文件中的检测框...");
    shrink_submission(input, &mut output, self.margin)?;
    output.finish()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::convert::Infallible;
  use std::sync::Arc;

  use super::*;
  use crate::model::{GlobalScores, ModelError, ModelRun, RawPrediction};
  use crate::output::SubmissionFormat;

  struct Fixed(RawPrediction);

  impl Detector for Fixed {
    type Input = str;
    type Error = ModelError;

    fn input_size(&self) -> u32 {
      64
    }

    fn infer_raw(&self, _: &str) -> Result<RawPrediction, ModelError> {
      Ok(self.0.clone())
    }
  }

  fn raw(score: f32) -> RawPrediction {
    RawPrediction {
      regression: vec![[0.0; 4]],
      classification: vec![score],
      num_classes: 1,
      global: GlobalScores([0.2, 0.3, 0.8]),
      anchors: Arc::from(vec![[8.0, 8.0, 24.0, 40.0]]),
    }
  }

  fn ids(names: &[&str]) -> impl Iterator<Item = Result<Sample<String>, Infallible>> + Clone {
    names
      .iter()
      .map(|n| Ok(Sample::new(*n, n.to_string())))
      .collect::<Vec<_>>()
      .into_iter()
  }

  #[test]
  fn submission_task_writes_one_line_per_image() {
    let mut buffer = Vec::new();
    let writer = SubmissionWriter::new(&mut buffer, SubmissionFormat::new(64)).unwrap();
    SubmissionTask::default()
      .run_task(ids(&["a", "b"]), Fixed(raw(0.9)), writer)
      .unwrap();

    let text = String::from_utf8(buffer).unwrap();
    assert_eq!(
      text,
      "patientId,PredictionString\n\
       a, 0.900 128.0 128.0 256.0 512.0\n\
       b, 0.900 128.0 128.0 256.0 512.0\n"
    );
  }

  #[test]
  fn dump_task_writes_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = RawPredictionStore::new(dir.path(), ModelRun::new("resnet34", None));
    let models = FoldEpoch::grid(&[0, 1], &[5])
      .into_iter()
      .map(|key| (key, Fixed(raw(0.5))))
      .collect::<Vec<_>>();

    DumpRawTask.run_task(ids(&["a", "b"]), models, &store).unwrap();
    for fold in [0, 1] {
      for id in ["a", "b"] {
        assert_eq!(store.load(FoldEpoch { fold, epoch: 5 }, id).unwrap(), raw(0.5));
      }
    }
  }
}
