// 该文件是 Nanfeng （南风） 项目的一部分。
// src/output.rs - 评估结果输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::{FromUrl, annotation::AnnotationRecord};

/// 保存合并后的标注序列，返回写入的文件路径
pub trait ResultWriter {
  type Error;
  fn write_annotations(
    &self,
    variant: usize,
    annotations: &[AnnotationRecord],
  ) -> Result<PathBuf, Self::Error>;
}

impl<W: ResultWriter> ResultWriter for &W {
  type Error = W::Error;

  fn write_annotations(
    &self,
    variant: usize,
    annotations: &[AnnotationRecord],
  ) -> Result<PathBuf, Self::Error> {
    (**self).write_annotations(variant, annotations)
  }
}

#[cfg(feature = "json_output")]
mod json_result;
#[cfg(feature = "json_output")]
pub use self::json_result::{JsonResultError, JsonResultOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "json_output")]
  #[error("JSON 结果输出错误: {0}")]
  JsonResultError(#[from] JsonResultError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  #[cfg(feature = "json_output")]
  JsonResultOutput(JsonResultOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "json_output")]
      <JsonResultOutput as crate::FromUrlWithScheme>::SCHEME => {
        let output = JsonResultOutput::from_url(url)?;
        Ok(OutputWrapper::JsonResultOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl ResultWriter for OutputWrapper {
  type Error = OutputError;

  fn write_annotations(
    &self,
    variant: usize,
    annotations: &[AnnotationRecord],
  ) -> Result<PathBuf, Self::Error> {
    match self {
      #[cfg(feature = "json_output")]
      OutputWrapper::JsonResultOutput(output) => output
        .write_annotations(variant, annotations)
        .map_err(OutputError::from),
    }
  }
}
