// 该文件是 Feijian （肺鉴） 项目的一部分。
// src/output/submission.rs - 提交文件
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

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{BBox, DetectResult},
  output::Render,
  query_value,
};

pub const SUBMISSION_HEADER: &str = "patientId,PredictionString";

/// 原始胸片的边长
pub const DEFAULT_NATIVE_SIZE: u32 = 1024;

const FIELDS_PER_BOX: usize = 5;

#[derive(Error, Debug)]
pub enum SubmissionError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("第 {line} 行格式错误: {reason}")]
  Malformed { line: usize, reason: String },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 提交文件中的一个框：分数与原始分辨率下的 `x y w h`
///
/// 读入与收缩都以 `f64` 进行，写出的小数位与双精度计算一致。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
  pub score: f64,
  pub x: f64,
  pub y: f64,
  pub w: f64,
  pub h: f64,
}

impl ScoredBox {
  fn write_to(&self, out: &mut String) {
    // 向 String 写入不会失败
    let _ = write!(
      out,
      " {:.3} {:.1} {:.1} {:.1} {:.1}",
      self.score, self.x, self.y, self.w, self.h
    );
  }
}

/// 模型输入坐标到原始分辨率的换算
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubmissionFormat {
  pub native_size: u32,
  pub input_size: u32,
}

impl SubmissionFormat {
  pub fn new(input_size: u32) -> Self {
    SubmissionFormat {
      native_size: DEFAULT_NATIVE_SIZE,
      input_size,
    }
  }

  pub fn with_native_size(mut self, native_size: u32) -> Self {
    self.native_size = native_size;
    self
  }

  pub fn scale(&self) -> f32 {
    self.native_size as f32 / self.input_size as f32
  }

  pub fn to_scored_box(&self, score: f32, bbox: &BBox) -> ScoredBox {
    // 换算在 f32 中进行，再无损扩展为 f64
    let scale = self.scale();
    ScoredBox {
      score: f64::from(score),
      x: f64::from(bbox[0] * scale),
      y: f64::from(bbox[1] * scale),
      w: f64::from((bbox[2] - bbox[0]) * scale),
      h: f64::from((bbox[3] - bbox[1]) * scale),
    }
  }

  /// 以空格开头的 `score x y w h` 组；结果为空时返回空串
  pub fn prediction_string(&self, result: &DetectResult) -> String {
    let mut out = String::new();
    for item in result.items.iter() {
      self.to_scored_box(item.score, &item.bbox).write_to(&mut out);
    }
    out
  }
}

/// 提交文件中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
  pub id: String,
  pub boxes: Vec<ScoredBox>,
}

impl SubmissionRecord {
  pub fn parse_line(line: &str, line_number: usize) -> Result<Self, SubmissionError> {
    let malformed = |reason: String| SubmissionError::Malformed {
      line: line_number,
      reason,
    };

    let (id, rest) = line
      .split_once(',')
      .ok_or_else(|| malformed("缺少逗号".to_string()))?;

    let values = rest
      .split_whitespace()
      .map(|v| v.parse::<f64>())
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| malformed(e.to_string()))?;

    if values.len() % FIELDS_PER_BOX != 0 {
      return Err(malformed(format!("数值个数 {} 不是 5 的倍数", values.len())));
    }

    let boxes = values
      .chunks_exact(FIELDS_PER_BOX)
      .map(|v| ScoredBox {
        score: v[0],
        x: v[1],
        y: v[2],
        w: v[3],
        h: v[4],
      })
      .collect();

    Ok(SubmissionRecord {
      id: id.trim().to_string(),
      boxes,
    })
  }

  pub fn to_line(&self) -> String {
    let mut out = String::with_capacity(self.id.len() + 1 + self.boxes.len() * 32);
    out.push_str(&self.id);
    out.push(',');
    for scored in &self.boxes {
      scored.write_to(&mut out);
    }
    out
  }
}

/// 逐行读取已有的提交文件，表头被跳过
pub struct SubmissionReader<R> {
  reader: R,
  line_number: usize,
  buffer: String,
}

impl<R: BufRead> SubmissionReader<R> {
  pub fn new(reader: R) -> Self {
    SubmissionReader {
      reader,
      line_number: 0,
      buffer: String::new(),
    }
  }
}

impl<R: BufRead> Iterator for SubmissionReader<R> {
  type Item = Result<SubmissionRecord, SubmissionError>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      self.buffer.clear();
      match self.reader.read_line(&mut self.buffer) {
        Ok(0) => return None,
        Ok(_) => {}
        Err(e) => return Some(Err(e.into())),
      }
      self.line_number += 1;

      let line = self.buffer.trim_end_matches(['\r', '\n']);
      if line.trim().is_empty() || line.starts_with(SUBMISSION_HEADER) {
        continue;
      }
      return Some(SubmissionRecord::parse_line(line, self.line_number));
    }
  }
}

/// 写入提交文件：表头一次，随后每张图像一行
pub struct SubmissionWriter<W: Write> {
  writer: W,
  format: SubmissionFormat,
  lines: usize,
}

impl<W: Write> SubmissionWriter<W> {
  pub fn new(mut writer: W, format: SubmissionFormat) -> Result<Self, SubmissionError> {
    writeln!(writer, "{}", SUBMISSION_HEADER)?;
    Ok(SubmissionWriter {
      writer,
      format,
      lines: 0,
    })
  }

  pub fn format(&self) -> &SubmissionFormat {
    &self.format
  }

  pub fn lines(&self) -> usize {
    self.lines
  }

  pub fn write_record(&mut self, record: &SubmissionRecord) -> Result<(), SubmissionError> {
    writeln!(self.writer, "{}", record.to_line())?;
    self.lines += 1;
    Ok(())
  }

  pub fn into_inner(mut self) -> Result<W, SubmissionError> {
    self.writer.flush()?;
    Ok(self.writer)
  }
}

impl<W: Write> Render<DetectResult> for SubmissionWriter<W> {
  type Error = SubmissionError;

  fn render_result(&mut self, image_id: &str, result: &DetectResult) -> Result<(), Self::Error> {
    let prediction = self.format.prediction_string(result);
    match result.category {
      Some(category) => debug!("{},{}      {:.2}", image_id, prediction, category),
      None => debug!("{},{}", image_id, prediction),
    }
    writeln!(self.writer, "{},{}", image_id, prediction)?;
    self.lines += 1;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), Self::Error> {
    self.writer.flush()?;
    info!("提交文件写入完成, 共 {} 行", self.lines);
    Ok(())
  }
}

/// 提交文件位置：`file:///path/to/submission.csv?native=1024`
#[derive(Debug, Clone)]
pub struct SubmissionFile {
  path: PathBuf,
  native_size: Option<u32>,
}

impl FromUrlWithScheme for SubmissionFile {
  const SCHEME: &'static str = "file";
}

impl FromUrl for SubmissionFile {
  type Error = SubmissionError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SubmissionError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    Ok(SubmissionFile {
      path: PathBuf::from(url.path()),
      native_size: query_value(url, "native"),
    })
  }
}

impl SubmissionFile {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    SubmissionFile {
      path: path.into(),
      native_size: None,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn native_size(&self) -> Option<u32> {
    self.native_size
  }

  pub fn create(
    &self,
    format: SubmissionFormat,
  ) -> Result<SubmissionWriter<BufWriter<File>>, SubmissionError> {
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    info!("写入提交文件: {}", self.path.display());
    let format = match self.native_size {
      Some(native_size) => format.with_native_size(native_size),
      None => format,
    };
    SubmissionWriter::new(BufWriter::new(File::create(&self.path)?), format)
  }

  pub fn open(&self) -> Result<SubmissionReader<std::io::BufReader<File>>, SubmissionError> {
    info!("读取提交文件: {}", self.path.display());
    Ok(SubmissionReader::new(std::io::BufReader::new(File::open(
      &self.path,
    )?)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DetectItem;

  fn result(items: Vec<DetectItem>) -> DetectResult {
    DetectResult {
      items: items.into_boxed_slice(),
      category: Some(0.82),
    }
  }

  #[test]
  fn boxes_are_scaled_to_native_resolution() {
    let format = SubmissionFormat::new(512);
    let result = result(vec![DetectItem {
      class_id: 0,
      score: 0.9,
      bbox: [100.0, 50.0, 150.0, 125.0],
    }]);
    assert_eq!(format.prediction_string(&result), " 0.900 200.0 100.0 100.0 150.0");
  }

  #[test]
  fn empty_result_gives_empty_prediction() {
    let mut writer = SubmissionWriter::new(Vec::new(), SubmissionFormat::new(512)).unwrap();
    writer.render_result("abc", &DetectResult::default()).unwrap();
    writer.finish().unwrap();
    let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
    assert_eq!(text, "patientId,PredictionString\nabc,\n");
  }

  #[test]
  fn lines_are_parsed_back() {
    let record = SubmissionRecord::parse_line("abc, 0.900 200.0 100.0 100.0 150.0", 2).unwrap();
    assert_eq!(record.id, "abc");
    assert_eq!(
      record.boxes,
      vec![ScoredBox {
        score: 0.9,
        x: 200.0,
        y: 100.0,
        w: 100.0,
        h: 150.0
      }]
    );
    assert_eq!(record.to_line(), "abc, 0.900 200.0 100.0 100.0 150.0");
  }

  #[test]
  fn incomplete_groups_are_rejected() {
    assert!(matches!(
      SubmissionRecord::parse_line("abc, 0.9 1 2 3", 7),
      Err(SubmissionError::Malformed { line: 7, .. })
    ));
    assert!(SubmissionRecord::parse_line("no comma here", 1).is_err());
  }

  #[test]
  fn reader_skips_header_and_blank_lines() {
    let text = "patientId,PredictionString\n\na,\nb, 0.500 1.0 2.0 3.0 4.0\n";
    let records: Vec<_> = SubmissionReader::new(text.as_bytes())
      .collect::<Result<_, _>>()
      .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].boxes.is_empty());
    assert_eq!(records[1].boxes[0].h, 4.0);
  }

  #[test]
  fn file_url_carries_native_size() {
    let url = Url::parse("file:///tmp/sub.csv?native=2048").unwrap();
    let file = SubmissionFile::from_url(&url).unwrap();
    assert_eq!(file.path(), Path::new("/tmp/sub.csv"));
    assert_eq!(file.native_size(), Some(2048));
  }
}
