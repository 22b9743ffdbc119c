// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/output/shrink.rs - 提交文件框收缩
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

use std::io::{BufRead, Write};

use tracing::info;

use crate::output::{ScoredBox, SubmissionError, SubmissionReader, SubmissionRecord, SubmissionWriter};

/// 每个框沿宽高各收缩 5%，中心不变
pub const DEFAULT_SHRINK_MARGIN: f64 = 0.05;

pub fn shrink_box(scored: &ScoredBox, margin: f64) -> ScoredBox {
  ScoredBox {
    score: scored.score,
    x: scored.x + scored.w * margin / 2.0,
    y: scored.y + scored.h * margin / 2.0,
    w: scored.w * (1.0 - margin),
    h: scored.h * (1.0 - margin),
  }
}

/// 读取提交文件并写出收缩后的版本，返回处理的行数
pub fn shrink_submission<R: BufRead, W: Write>(
  reader: SubmissionReader<R>,
  writer: &mut SubmissionWriter<W>,
  margin: f64,
) -> Result<usize, SubmissionError> {
  let mut count = 0;
  for record in reader {
    let record = record?;
    let shrunk = SubmissionRecord {
      boxes: record.boxes.iter().map(|b| shrink_box(b, margin)).collect(),
      id: record.id,
    };
    writer.write_record(&shrunk)?;
    count += 1;
  }

  info!("收缩 {} 行, 比例 {}", count, margin);
  Ok(count)
}
