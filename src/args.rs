// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use url::Url;

use feijian::model::{
  FoldEpoch, FusionMode, ModelRun, PostProcessor, SizeReduction, fusion::DEFAULT_THRESHOLD,
  nms::DEFAULT_IOU_THRESHOLD,
};

/// Feijian 肺部病灶检测提交工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 单个检查点生成提交文件
  PrepareSubmission {
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    images: ImageArgs,
    #[command(flatten)]
    submission: SubmissionArgs,
    /// 训练折
    #[arg(long)]
    fold: u32,
    /// 轮次
    #[arg(long)]
    epoch: u32,
  },
  /// 多折多轮次在线集成生成提交文件
  PrepareSubmissionMultifolds {
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    images: ImageArgs,
    #[command(flatten)]
    submission: SubmissionArgs,
    #[command(flatten)]
    grid: GridArgs,
    #[command(flatten)]
    fusion: FusionArgs,
    /// 尺寸分量取该百分位数，缺省时取均值
    #[arg(long, value_name = "PERCENT")]
    size_percentile: Option<f32>,
  },
  /// 导出每个 (折, 轮次) 的原始输出到缓存
  PrepareTestPredictions {
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    images: ImageArgs,
    #[command(flatten)]
    grid: GridArgs,
    #[command(flatten)]
    cache: CacheArgs,
  },
  /// 从缓存的原始输出集成生成提交文件
  PrepareSubmissionFromSaved {
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    submission: SubmissionArgs,
    #[command(flatten)]
    grid: GridArgs,
    #[command(flatten)]
    fusion: FusionArgs,
    #[command(flatten)]
    cache: CacheArgs,
    /// 患者列表（样例提交文件）
    #[arg(long, value_name = "CSV")]
    patients: PathBuf,
    /// 尺寸分量的百分位数
    #[arg(long, default_value = "10", value_name = "PERCENT")]
    size_percentile: f32,
  },
  /// 收缩已有提交文件中的检测框
  ReduceWh {
    /// 原提交文件
    #[arg(long, value_name = "INPUT")]
    input: Url,
    /// 新提交文件
    #[arg(long, value_name = "OUTPUT")]
    output: Url,
    /// 收缩比例
    #[arg(long, default_value = "0.05")]
    margin: f64,
  },
}

#[derive(Args, Debug)]
#[cfg_attr(not(feature = "rknn"), allow(dead_code))]
pub struct ModelArgs {
  /// 模型名
  #[arg(long)]
  pub model: String,
  /// 运行标签
  #[arg(long, default_value = "")]
  pub run: String,
  /// 模型输入尺寸
  #[arg(long, default_value = "512")]
  pub img_size: u32,
  /// 检查点根目录
  #[arg(long, default_value = "checkpoints", value_name = "DIR")]
  pub checkpoints: PathBuf,
  /// 逐框分类的类别数
  #[arg(long, default_value = "1")]
  pub num_classes: usize,
}

impl ModelArgs {
  pub fn model_run(&self) -> ModelRun {
    ModelRun::new(self.model.clone(), Some(self.run.clone()))
  }
}

#[derive(Args, Debug)]
pub struct ImageArgs {
  /// 图像目录，例如 images:///data/test_png?ext=png
  #[arg(long, value_name = "SOURCE")]
  pub images: Url,
  /// 患者列表（样例提交文件）
  #[arg(long, value_name = "CSV")]
  pub patients: PathBuf,
}

#[derive(Args, Debug)]
pub struct SubmissionArgs {
  /// 提交文件，例如 file:///submissions/sub.csv
  #[arg(long, value_name = "OUTPUT")]
  pub submission: Url,
  /// 纳入阈值
  #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
  pub threshold: f32,
  /// 抑制时的 IoU 阈值
  #[arg(long, default_value_t = DEFAULT_IOU_THRESHOLD)]
  pub iou_threshold: f32,
}

impl SubmissionArgs {
  pub fn post_processor(&self) -> PostProcessor {
    PostProcessor::default().with_iou_threshold(self.iou_threshold)
  }
}

#[derive(Args, Debug)]
pub struct GridArgs {
  /// 轮次
  #[arg(long, num_args = 1.., required = true)]
  pub epoch: Vec<u32>,
  /// 训练折
  #[arg(long, num_args = 1.., default_values_t = [0, 1, 2, 3])]
  pub folds: Vec<u32>,
}

impl GridArgs {
  pub fn keys(&self) -> Vec<FoldEpoch> {
    FoldEpoch::grid(&self.folds, &self.epoch)
  }
}

#[derive(Args, Debug)]
pub struct FusionArgs {
  /// 使用全图分类信号
  #[arg(long)]
  pub use_global_cat: bool,
}

impl FusionArgs {
  pub fn mode(&self) -> FusionMode {
    if self.use_global_cat {
      FusionMode::Global
    } else {
      FusionMode::BoxOnly
    }
  }
}

#[derive(Args, Debug)]
pub struct CacheArgs {
  /// 原始输出缓存根目录
  #[arg(long, default_value = "output/test_predictions", value_name = "DIR")]
  pub cache: PathBuf,
}

#[cfg_attr(not(feature = "rknn"), allow(dead_code))]
pub fn size_reduction(percentile: Option<f32>) -> SizeReduction {
  percentile.map_or(SizeReduction::Mean, SizeReduction::Percentile)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_threshold_reaches_post_processor() {
    let cli = Cli::try_parse_from([
      "feijian",
      "prepare-submission-from-saved",
      "--model",
      "resnet34",
      "--submission",
      "file:///tmp/sub.csv",
      "--iou-threshold",
      "0.2",
      "--epoch",
      "12",
      "--patients",
      "sample.csv",
    ])
    .unwrap();
    let Command::PrepareSubmissionFromSaved { submission, .. } = cli.command else {
      panic!("子命令解析错误");
    };
    assert_eq!(submission.post_processor().iou_threshold, 0.2);
  }

  #[test]
  fn iou_threshold_defaults_to_low_overlap() {
    let cli = Cli::try_parse_from([
      "feijian",
      "prepare-submission-from-saved",
      "--model",
      "resnet34",
      "--submission",
      "file:///tmp/sub.csv",
      "--epoch",
      "12",
      "--patients",
      "sample.csv",
    ])
    .unwrap();
    let Command::PrepareSubmissionFromSaved { submission, .. } = cli.command else {
      panic!("子命令解析错误");
    };
    assert_eq!(submission.post_processor(), PostProcessor::default());
  }
}
