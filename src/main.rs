// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/main.rs - 命令行入口
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

mod args;

use std::convert::Infallible;
use std::fs::File;
use std::io::BufWriter;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use feijian::{
  FromUrl,
  input::{ImageDirectoryInput, ImageSamples, Sample, read_patient_ids},
  model::{
    CachedEnsemble, FoldEpoch, FusionMode, PredictionAggregator, ScoreFusion, SizeReduction,
  },
  output::{DEFAULT_NATIVE_SIZE, SubmissionFile, SubmissionFormat, SubmissionWriter},
  store::RawPredictionStore,
  task::{ShrinkTask, SubmissionTask, Task},
};

use crate::args::{CacheArgs, Cli, Command, ImageArgs, ModelArgs, SubmissionArgs};

#[cfg_attr(not(feature = "rknn"), allow(dead_code))]
fn image_samples(images: &ImageArgs, size: u32) -> Result<ImageSamples> {
  let ids = read_patient_ids(&images.patients)?;
  let input = ImageDirectoryInput::from_url(&images.images)?.with_size(size);
  info!("图像目录: {}, 输入尺寸 {}", images.images, size);
  Ok(input.samples(ids))
}

fn submission_writer(
  submission: &SubmissionArgs,
  size: u32,
) -> Result<SubmissionWriter<BufWriter<File>>> {
  let file = SubmissionFile::from_url(&submission.submission)?;
  Ok(file.create(SubmissionFormat::new(size))?)
}

#[cfg(feature = "rknn")]
mod live {
  use anyhow::Result;
  use tracing::info;

  use feijian::{
    frame::GrayFrame,
    model::{
      CheckpointLocator, DetectorLoader, Ensemble, FoldEpoch, FusionMode, PredictionAggregator,
      RetinaRknn, RetinaRknnLoader, ScoreFusion, SizeReduction,
    },
    store::RawPredictionStore,
    task::{DumpRawTask, SubmissionTask, Task},
  };

  use crate::args::{CacheArgs, ImageArgs, ModelArgs, SubmissionArgs};
  use crate::{image_samples, submission_writer};

  fn load(model: &ModelArgs, keys: &[FoldEpoch]) -> Result<Vec<(FoldEpoch, RetinaRknn<GrayFrame>)>> {
    let locator = CheckpointLocator::new(&model.checkpoints, model.model_run());
    let loader = RetinaRknnLoader::<GrayFrame>::new(model.img_size, model.num_classes);
    let detectors = loader.load_all(&locator, keys)?;
    info!("加载 {} 个检查点", detectors.len());
    Ok(detectors)
  }

  pub fn prepare_submission(
    model: &ModelArgs,
    images: &ImageArgs,
    submission: &SubmissionArgs,
    key: FoldEpoch,
  ) -> Result<()> {
    let (_, detector) = load(model, &[key])?
      .pop()
      .ok_or_else(|| anyhow::anyhow!("没有加载到检查点"))?;
    let fusion = ScoreFusion::new(submission.threshold, FusionMode::Global);

    SubmissionTask::new(submission.post_processor(), fusion).run_task(
      image_samples(images, model.img_size)?,
      detector,
      submission_writer(submission, model.img_size)?,
    )
  }

  pub fn prepare_submission_multifolds(
    model: &ModelArgs,
    images: &ImageArgs,
    submission: &SubmissionArgs,
    keys: &[FoldEpoch],
    mode: FusionMode,
    size_reduction: SizeReduction,
  ) -> Result<()> {
    let members = load(model, keys)?.into_iter().map(|(_, d)| d).collect();
    let ensemble =
      Ensemble::with_aggregator(members, PredictionAggregator::new(size_reduction))?;
    let fusion = ScoreFusion::new(submission.threshold, mode);

    SubmissionTask::new(submission.post_processor(), fusion).run_task(
      image_samples(images, model.img_size)?,
      ensemble,
      submission_writer(submission, model.img_size)?,
    )
  }

  pub fn prepare_test_predictions(
    model: &ModelArgs,
    images: &ImageArgs,
    keys: &[FoldEpoch],
    cache: &CacheArgs,
  ) -> Result<()> {
    let store = RawPredictionStore::new(&cache.cache, model.model_run());
    let detectors = load(model, keys)?;
    DumpRawTask.run_task(image_samples(images, model.img_size)?, detectors, &store)
  }
}

#[cfg(not(feature = "rknn"))]
fn require_rknn() -> Result<()> {
  anyhow::bail!("未启用 rknn 特性, 无法加载检查点")
}

fn prepare_submission_from_saved(
  model: &ModelArgs,
  submission: &SubmissionArgs,
  cache: &CacheArgs,
  keys: Vec<FoldEpoch>,
  patients: &std::path::Path,
  mode: FusionMode,
  size_percentile: f32,
) -> Result<()> {
  let store = RawPredictionStore::new(&cache.cache, model.model_run());
  let aggregator =
    PredictionAggregator::new(SizeReduction::Percentile(size_percentile));
  let ensemble = CachedEnsemble::new(store, keys, aggregator, model.img_size)?;
  info!("从缓存集成 {} 份原始输出", ensemble.keys().len());

  let ids = read_patient_ids(patients)?;
  let samples = ids
    .into_iter()
    .map(|id| Ok::<_, Infallible>(Sample::new(id.clone(), id)));
  let fusion = ScoreFusion::new(submission.threshold, mode);

  SubmissionTask::new(submission.post_processor(), fusion).run_task(
    samples,
    ensemble,
    submission_writer(submission, model.img_size)?,
  )
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let cli = Cli::parse();
  info!("命令: {:?}", cli.command);

  match cli.command {
    #[cfg(feature = "rknn")]
    Command::PrepareSubmission {
      model,
      images,
      submission,
      fold,
      epoch,
    } => live::prepare_submission(
      &model,
      &images,
      &submission,
      FoldEpoch { fold, epoch },
    ),
    #[cfg(feature = "rknn")]
    Command::PrepareSubmissionMultifolds {
      model,
      images,
      submission,
      grid,
      fusion,
      size_percentile,
    } => live::prepare_submission_multifolds(
      &model,
      &images,
      &submission,
      &grid.keys(),
      fusion.mode(),
      args::size_reduction(size_percentile),
    ),
    #[cfg(feature = "rknn")]
    Command::PrepareTestPredictions {
      model,
      images,
      grid,
      cache,
    } => live::prepare_test_predictions(&model, &images, &grid.keys(), &cache),
    #[cfg(not(feature = "rknn"))]
    Command::PrepareSubmission { .. }
    | Command::PrepareSubmissionMultifolds { .. }
    | Command::PrepareTestPredictions { .. } => require_rknn(),
    Command::PrepareSubmissionFromSaved {
      model,
      submission,
      grid,
      fusion,
      cache,
      patients,
      size_percentile,
    } => prepare_submission_from_saved(
      &model,
      &submission,
      &cache,
      grid.keys(),
      &patients,
      fusion.mode(),
      size_percentile,
    ),
    Command::ReduceWh {
      input,
      output,
      margin,
    } => {
      let reader = SubmissionFile::from_url(&input)?.open()?;
      let writer = SubmissionFile::from_url(&output)?.create(SubmissionFormat::new(DEFAULT_NATIVE_SIZE))?;
      ShrinkTask::default()
        .with_margin(margin)
        .run_task(reader, (), writer)
    }
  }
}
