// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/input/image_directory.rs - 图像目录输入
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

use image::{GrayImage, ImageReader, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::GrayFrame, input::Sample, query_value};

const DEFAULT_EXTENSION: &str = "png";
const DEFAULT_SIZE: u32 = 512;

#[derive(Error, Debug)]
pub enum ImageInputError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("图像不存在: {0}")]
  Missing(PathBuf),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 按患者编号从目录加载图像
///
/// `images:///data/test_png?ext=png&size=512`
#[derive(Debug, Clone)]
pub struct ImageDirectoryInput {
  dir: PathBuf,
  extension: String,
  size: u32,
}

impl FromUrlWithScheme for ImageDirectoryInput {
  const SCHEME: &'static str = "images";
}

impl FromUrl for ImageDirectoryInput {
  type Error = ImageInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageInputError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let extension = query_value(url, "ext").unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    let size = query_value(url, "size").unwrap_or(DEFAULT_SIZE);
    Ok(ImageDirectoryInput::new(url.path(), extension, size))
  }
}

impl ImageDirectoryInput {
  pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>, size: u32) -> Self {
    ImageDirectoryInput {
      dir: dir.into(),
      extension: extension.into(),
      size,
    }
  }

  pub fn size(&self) -> u32 {
    self.size
  }

  /// 覆盖 URL 中的尺寸，使其与模型输入一致
  pub fn with_size(mut self, size: u32) -> Self {
    self.size = size;
    self
  }

  pub fn path(&self, id: &str) -> PathBuf {
    self.dir.join(format!("{}.{}", id, self.extension))
  }

  /// 读取为 8 位灰度并双线性缩放到模型输入尺寸
  pub fn load(&self, id: &str) -> Result<GrayFrame, ImageInputError> {
    let path = self.path(id);
    if !path.is_file() {
      error!("图像不存在: {}", path.display());
      return Err(ImageInputError::Missing(path));
    }

    let image = ImageReader::open(&path)?.decode()?.to_luma8();
    debug!(
      "读取图像 {}: {}x{}",
      path.display(),
      image.width(),
      image.height()
    );
    Ok(GrayFrame::from(self.resize(image)))
  }

  fn resize(&self, image: GrayImage) -> GrayImage {
    if image.dimensions() == (self.size, self.size) {
      return image;
    }
    image::imageops::resize(&image, self.size, self.size, FilterType::Triangle)
  }

  pub fn samples(self, ids: Vec<String>) -> ImageSamples {
    ImageSamples {
      input: self,
      ids,
      next: 0,
    }
  }
}

impl From<GrayImage> for GrayFrame {
  fn from(image: GrayImage) -> Self {
    let mut frame = GrayFrame::zeros(image.width());
    let size = frame.width();
    let slice = frame.as_mut();

    for (x, y, pixel) in image.enumerate_pixels() {
      if (x as usize) < size && (y as usize) < size {
        slice[(y as usize) * size + (x as usize)] = pixel[0];
      }
    }
    frame
  }
}

/// 逐个加载图像；克隆后可从头再遍历一次
#[derive(Debug, Clone)]
pub struct ImageSamples {
  input: ImageDirectoryInput,
  ids: Vec<String>,
  next: usize,
}

impl Iterator for ImageSamples {
  type Item = Result<Sample<GrayFrame>, ImageInputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let id = self.ids.get(self.next)?;
    self.next += 1;
    Some(self.input.load(id).map(|frame| Sample::new(id.clone(), frame)))
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    let remaining = self.ids.len() - self.next;
    (remaining, Some(remaining))
  }
}
