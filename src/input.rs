// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/input.rs - 输入
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

pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

/// 带编号的一份输入，编号即患者编号
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<T> {
  pub id: String,
  pub input: T,
}

impl<T> Sample<T> {
  pub fn new(id: impl Into<String>, input: T) -> Self {
    Sample {
      id: id.into(),
      input,
    }
  }
}

#[cfg(feature = "read_image_file")]
mod image_directory;
mod patient_list;

#[cfg(feature = "read_image_file")]
pub use self::image_directory::{ImageDirectoryInput, ImageInputError, ImageSamples};
pub use self::patient_list::{PatientListError, read_patient_ids};

