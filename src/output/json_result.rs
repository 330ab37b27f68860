// 该文件是 Nanfeng （南风） 项目的一部分。
// src/output/json_result.rs - 标注结果 JSON 文件输出
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

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::PathBuf,
};

use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, annotation::AnnotationRecord, output::ResultWriter};

pub const RESULT_FILE_NAME: &str = "result.json";

#[derive(Error, Debug)]
pub enum JsonResultError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerdeError(#[from] serde_json::Error),
}

/// 把标注序列写成一个 JSON 数组
///
/// 分支 0 写入 `result.json`，其余分支写入 `result_variant_<j>.json`。
#[derive(Debug, Clone)]
pub struct JsonResultOutput {
  directory: PathBuf,
}

impl JsonResultOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
    }
  }

  pub fn result_path(&self, variant: usize) -> PathBuf {
    if variant == 0 {
      self.directory.join(RESULT_FILE_NAME)
    } else {
      self
        .directory
        .join(format!("result_variant_{}.json", variant))
    }
  }
}

impl FromUrlWithScheme for JsonResultOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonResultOutput {
  type Error = JsonResultError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        uri.scheme()
      );
      return Err(JsonResultError::SchemeMismatch(uri.scheme().to_string()));
    }

    Ok(JsonResultOutput::new(uri.path()))
  }
}

impl ResultWriter for JsonResultOutput {
  type Error = JsonResultError;

  fn write_annotations(
    &self,
    variant: usize,
    annotations: &[AnnotationRecord],
  ) -> Result<PathBuf, Self::Error> {
    std::fs::create_dir_all(&self.directory)?;
    let path = self.result_path(variant);
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer(&mut writer, annotations)?;
    writer.flush()?;
    info!("保存 {} 条标注到文件: {}", annotations.len(), path.display());
    Ok(path)
  }
}
