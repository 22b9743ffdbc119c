// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/frame.rs - 灰度帧定义
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

use thiserror::Error;

use crate::input::AsNhwcFrame;

const GRAY_CHANNELS: usize = 1;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct FrameShapeError {
  pub expected: usize,
  pub actual: usize,
}

/// 单通道方形帧，即模型输入分辨率下的胸片
#[derive(Debug, Clone, PartialEq)]
pub struct GrayFrame {
  size: u32,
  data: Box<[u8]>,
}

impl GrayFrame {
  pub fn new(size: u32, data: Vec<u8>) -> Result<Self, FrameShapeError> {
    let expected = GRAY_CHANNELS * (size as usize) * (size as usize);
    if data.len() != expected {
      return Err(FrameShapeError {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      size,
      data: data.into_boxed_slice(),
    })
  }

  pub fn zeros(size: u32) -> Self {
    let data = vec![0u8; GRAY_CHANNELS * (size as usize) * (size as usize)];
    Self {
      size,
      data: data.into_boxed_slice(),
    }
  }

  pub fn height(&self) -> usize {
    self.size as usize
  }

  pub fn width(&self) -> usize {
    self.size as usize
  }

  pub fn size(&self) -> u32 {
    self.size
  }
}

impl AsMut<[u8]> for GrayFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl AsNhwcFrame for GrayFrame {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_wrong_length() {
    let err = GrayFrame::new(4, vec![0; 15]).unwrap_err();
    assert_eq!(
      err,
      FrameShapeError {
        expected: 16,
        actual: 15
      }
    );
  }

  #[test]
  fn zeros_has_square_shape() {
    let frame = GrayFrame::zeros(8);
    assert_eq!(frame.height(), 8);
    assert_eq!(frame.width(), 8);
    assert_eq!(frame.as_nhwc().len(), 64);
  }
}
