// 该文件是 Nanfeng （南风） 项目的一部分。
// src/output/directory_record.rs - 逐样本检测记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, annotation::AnnotationRecord};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 每个样本写一个文本文件，每行一个目标：`名称, 分数, 框参数...`
#[derive(Debug, Clone)]
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  skip_empty: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let skip_empty = uri.query_pairs().any(|(k, _)| k == "skip_empty");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      skip_empty,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl AsRef<Path>) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      skip_empty: false,
    }
  }

  /// 文件名优先使用 `frame_id`，否则使用样本序号
  fn sample_path(&self, index: usize, record: &AnnotationRecord) -> PathBuf {
    let stem = record
      .frame_id()
      .map(str::to_string)
      .unwrap_or_else(|| format!("{:06}", index));
    self.directory.join(stem).with_extension("txt")
  }

  pub fn record(
    &self,
    index: usize,
    record: &AnnotationRecord,
  ) -> Result<Option<PathBuf>, DirectoryRecordOutputError> {
    if self.skip_empty && record.num_objects() == 0 {
      return Ok(None);
    }
    if !self.directory.exists() {
      std::fs::create_dir_all(&self.directory)?;
    }

    let scores = record.fields.get("score").and_then(Value::as_array);
    let boxes = record.fields.get("boxes_lidar").and_then(Value::as_array);

    let mut lines = Vec::with_capacity(record.num_objects());
    for (i, name) in record.name.iter().enumerate() {
      let mut line = name.clone();
      if let Some(score) = scores.and_then(|s| s.get(i)).and_then(Value::as_f64) {
        line.push_str(&format!(", {:.4}", score));
      }
      if let Some(bbox) = boxes.and_then(|b| b.get(i)).and_then(Value::as_array) {
        for v in bbox.iter().filter_map(Value::as_f64) {
          line.push_str(&format!(", {:.4}", v));
        }
      }
      lines.push(line);
    }

    let path = self.sample_path(index, record);
    std::fs::write(&path, lines.join("\n"))?;
    debug!("写入检测记录: {}", path.display());
    Ok(Some(path))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_record_lines() {
    let tmp = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::new(tmp.path());
    let record = AnnotationRecord::new(["Car", "Cyclist"])
      .with_field("frame_id", "000007")
      .with_field("score", json!([0.9, 0.25]))
      .with_field("boxes_lidar", json!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
    let path = output.record(3, &record).unwrap().unwrap();
    assert_eq!(path, tmp.path().join("000007.txt"));
    let content = std::fs::read_to_string(path).unwrap();
    assert_eq!(
      content,
      "Car, 0.9000, 1.0000, 2.0000, 3.0000\nCyclist, 0.2500, 4.0000, 5.0000, 6.0000"
    );
  }

  #[test]
  fn test_skip_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("folder://{}?skip_empty", tmp.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    let record = AnnotationRecord::new(Vec::<String>::new());
    assert!(output.record(0, &record).unwrap().is_none());
  }
}
