// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/input/patient_list.rs - 测试集患者编号
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
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum PatientListError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("患者列表为空: {0}")]
  Empty(PathBuf),
}

/// 读取样例提交文件的第一列，跳过表头与空行
pub fn read_patient_ids(path: &Path) -> Result<Vec<String>, PatientListError> {
  let reader = BufReader::new(File::open(path)?);
  let mut ids = Vec::new();

  for line in reader.lines().skip(1) {
    let line = line?;
    let id = line.split(',').next().unwrap_or_default().trim();
    if !id.is_empty() {
      ids.push(id.to_string());
    }
  }

  if ids.is_empty() {
    return Err(PatientListError::Empty(path.to_path_buf()));
  }

  info!("读取 {} 个患者编号: {}", ids.len(), path.display());
  Ok(ids)
}
