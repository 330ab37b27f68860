// 该文件是 Nanfeng （南风） 项目的一部分。
// src/config.rs - 评估配置
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

use std::{collections::BTreeSet, path::PathBuf};

use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, metric::Threshold, sampler::ShardLayout};

pub const DEFAULT_RECALL_THRESHOLDS: [f64; 3] = [0.3, 0.5, 0.7];
pub const DEFAULT_EVAL_METRIC: &str = "kitti";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch { expected: String, actual: String },
  #[error("未配置召回阈值")]
  MissingThresholds,
  #[error("召回阈值无效: {0}")]
  InvalidThreshold(String),
  #[error("召回阈值重复: {0}")]
  DuplicateThreshold(f64),
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
}

/// 一次评估的配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
  pub recall_thresholds: Vec<Threshold>,
  pub eval_metric: String,
  pub eval_by_range: bool,
  pub save_to_file: bool,
  pub smoke_test: bool,
  pub epoch_id: String,
  pub result_dir: PathBuf,
  pub shard_layout: ShardLayout,
}

impl EvalConfig {
  pub fn new(thresholds: &[f64]) -> Result<Self, ConfigError> {
    Ok(Self {
      recall_thresholds: parse_thresholds(thresholds.iter().copied())?,
      eval_metric: DEFAULT_EVAL_METRIC.to_string(),
      eval_by_range: false,
      save_to_file: false,
      smoke_test: false,
      epoch_id: "no_number".to_string(),
      result_dir: dated_result_dir(),
      shard_layout: ShardLayout::default(),
    })
  }

  pub fn with_eval_metric(mut self, metric: impl Into<String>) -> Self {
    self.eval_metric = metric.into();
    self
  }

  pub fn with_eval_by_range(mut self, by_range: bool) -> Self {
    self.eval_by_range = by_range;
    self
  }

  pub fn with_save_to_file(mut self, save: bool) -> Self {
    self.save_to_file = save;
    self
  }

  pub fn with_smoke_test(mut self, smoke_test: bool) -> Self {
    self.smoke_test = smoke_test;
    self
  }

  pub fn with_epoch_id(mut self, epoch_id: impl Into<String>) -> Self {
    self.epoch_id = epoch_id.into();
    self
  }

  pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.result_dir = dir.into();
    self
  }

  pub fn with_shard_layout(mut self, layout: ShardLayout) -> Self {
    self.shard_layout = layout;
    self
  }

  /// 反序列化得到的配置需要重新检查阈值
  pub fn validate(&self) -> Result<(), ConfigError> {
    parse_thresholds(self.recall_thresholds.iter().map(Threshold::value)).map(|_| ())
  }

  pub fn final_output_dir(&self) -> PathBuf {
    self.result_dir.join("final_result").join("data")
  }
}

fn parse_thresholds(values: impl Iterator<Item = f64>) -> Result<Vec<Threshold>, ConfigError> {
  let mut seen = BTreeSet::new();
  let mut thresholds = Vec::new();
  for value in values {
    let threshold =
      Threshold::new(value).ok_or_else(|| ConfigError::InvalidThreshold(value.to_string()))?;
    if !seen.insert(threshold) {
      return Err(ConfigError::DuplicateThreshold(value));
    }
    thresholds.push(threshold);
  }
  if thresholds.is_empty() {
    return Err(ConfigError::MissingThresholds);
  }
  Ok(thresholds)
}

fn dated_result_dir() -> PathBuf {
  let now = Local::now();
  PathBuf::from("output")
    .join("eval")
    .join(now.year().to_string())
    .join(format!("{:02}", now.month()))
    .join(format!("{:02}", now.day()))
    .join(now.format("%H-%M-%S").to_string())
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
  match value {
    "" | "1" | "true" | "yes" => Ok(true),
    "0" | "false" | "no" => Ok(false),
    _ => Err(ConfigError::InvalidParameter {
      key: key.to_string(),
      value: value.to_string(),
    }),
  }
}

impl FromUrlWithScheme for EvalConfig {
  const SCHEME: &'static str = "eval";
}

impl FromUrl for EvalConfig {
  type Error = ConfigError;

  /// `eval://kitti?thresholds=0.3,0.5,0.7&range=1&save=1&smoke=0&layout=strided&epoch=80&dir=output/x`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        actual: url.scheme().to_string(),
      });
    }

    let mut config = EvalConfig::new(&DEFAULT_RECALL_THRESHOLDS)?;
    if let Some(metric) = url.host_str().filter(|h| !h.is_empty()) {
      config.eval_metric = metric.to_string();
    }

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "thresholds" => {
          let values = value
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
              s.trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidThreshold(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
          config.recall_thresholds = parse_thresholds(values.into_iter())?;
        }
        "range" => config.eval_by_range = parse_flag(&key, &value)?,
        "save" => config.save_to_file = parse_flag(&key, &value)?,
        "smoke" => config.smoke_test = parse_flag(&key, &value)?,
        "epoch" => config.epoch_id = value.to_string(),
        "dir" => config.result_dir = PathBuf::from(value.as_ref()),
        "layout" => {
          config.shard_layout = value.parse().map_err(|_| ConfigError::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
          })?
        }
        _ => {
          return Err(ConfigError::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
          });
        }
      }
    }

    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_thresholds_are_fatal() {
    assert_eq!(EvalConfig::new(&[]), Err(ConfigError::MissingThresholds));
  }

  #[test]
  fn test_duplicate_thresholds_are_fatal() {
    assert_eq!(
      EvalConfig::new(&[0.5, 0.5]),
      Err(ConfigError::DuplicateThreshold(0.5))
    );
  }

  #[test]
  fn test_from_url() {
    let url = Url::parse(
      "eval://waymo?thresholds=0.5,0.7&range=1&save&epoch=80&dir=/tmp/eval&layout=contiguous",
    )
    .unwrap();
    let config = EvalConfig::from_url(&url).unwrap();
    assert_eq!(config.eval_metric, "waymo");
    assert_eq!(config.recall_thresholds.len(), 2);
    assert!(config.eval_by_range);
    assert!(config.save_to_file);
    assert!(!config.smoke_test);
    assert_eq!(config.epoch_id, "80");
    assert_eq!(config.result_dir, PathBuf::from("/tmp/eval"));
    assert_eq!(config.shard_layout, ShardLayout::Contiguous);
  }

  #[test]
  fn test_from_url_defaults() {
    let config = EvalConfig::from_url(&Url::parse("eval://").unwrap()).unwrap();
    assert_eq!(config.eval_metric, DEFAULT_EVAL_METRIC);
    assert_eq!(config.recall_thresholds.len(), 3);
    assert!(config.result_dir.starts_with("output/eval"));
  }

  #[test]
  fn test_from_url_rejects_empty_thresholds() {
    let url = Url::parse("eval://kitti?thresholds=").unwrap();
    assert_eq!(EvalConfig::from_url(&url), Err(ConfigError::MissingThresholds));
  }

  #[test]
  fn test_from_url_scheme_mismatch() {
    let url = Url::parse("json:///tmp").unwrap();
    assert!(matches!(
      EvalConfig::from_url(&url),
      Err(ConfigError::SchemeMismatch { .. })
    ));
  }
}
