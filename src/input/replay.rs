// 该文件是 Nanfeng （南风） 项目的一部分。
// src/input/replay.rs - 回放已记录的推理结果
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
  collections::{BTreeMap, HashMap},
  fs::File,
  io::{BufRead, BufReader},
  path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  annotation::AnnotationRecord,
  dataset::{Dataset, EvaluationResult},
  metric::BatchRecord,
  model::{Model, ModelOutput},
  sampler::{ShardLayout, shard_indices},
};

const DEFAULT_CLASS_NAMES: [&str; 3] = ["Car", "Pedestrian", "Cyclist"];
const DEFAULT_BATCH_SIZE: usize = 1;

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("第 {line} 行解析失败: {source}")]
  ParseError {
    line: usize,
    source: serde_json::Error,
  },
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("批次内样本的统计条数不一致")]
  InconsistentRecords,
  #[error("批次内样本的预测分支数不一致")]
  InconsistentVariants,
  #[error("空批次")]
  EmptyBatch,
  #[cfg(feature = "directory_record")]
  #[error("检测记录写入错误: {0}")]
  RecordError(#[from] crate::output::DirectoryRecordOutputError),
}

/// 一个样本的记录：各分段的召回统计，以及各预测分支的标注
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySample {
  pub records: Vec<BatchRecord>,
  pub predictions: Vec<AnnotationRecord>,
}

/// 由若干样本组成的批次，`indices` 为样本在数据集中的下标
#[derive(Debug, Clone)]
pub struct ReplayBatch {
  pub indices: Vec<usize>,
  pub samples: Vec<ReplaySample>,
}

/// 从 JSON Lines 文件读取的推理记录，每行一个样本
#[derive(Debug, Clone)]
pub struct ReplayInput {
  samples: Vec<ReplaySample>,
  class_names: Vec<String>,
  batch_size: usize,
}

impl FromUrlWithScheme for ReplayInput {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayInput {
  type Error = ReplayError;

  /// `replay:///path/samples.jsonl?classes=Car,Pedestrian,Cyclist&batch_size=4`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayError::SchemeMismatch);
    }

    let query_pairs: HashMap<_, _> = url.query_pairs().collect();
    let class_names = query_pairs
      .get("classes")
      .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
      .unwrap_or_else(|| DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect());
    let batch_size = match query_pairs.get("batch_size") {
      Some(v) => v
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ReplayError::InvalidParameter {
          key: "batch_size".to_string(),
          value: v.to_string(),
        })?,
      None => DEFAULT_BATCH_SIZE,
    };

    let samples = Self::read_samples(url.path())?;
    info!("读取 {} 个回放样本: {}", samples.len(), url.path());

    Ok(ReplayInput {
      samples,
      class_names,
      batch_size,
    })
  }
}

impl ReplayInput {
  pub fn new(samples: Vec<ReplaySample>, class_names: Vec<String>, batch_size: usize) -> Self {
    Self {
      samples,
      class_names,
      batch_size: batch_size.max(1),
    }
  }

  fn read_samples(path: impl AsRef<Path>) -> Result<Vec<ReplaySample>, ReplayError> {
    let reader = BufReader::new(File::open(path)?);
    let mut samples = Vec::new();
    for (index, line) in reader.lines().enumerate() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }
      let sample = serde_json::from_str(&line).map_err(|source| ReplayError::ParseError {
        line: index + 1,
        source,
      })?;
      samples.push(sample);
    }
    Ok(samples)
  }

  pub fn len(&self) -> usize {
    self.samples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.samples.is_empty()
  }

  pub fn batch_size(&self) -> usize {
    self.batch_size
  }

  pub fn dataset(&self) -> ReplayDataset {
    ReplayDataset {
      class_names: self.class_names.clone(),
      num_samples: self.samples.len(),
    }
  }

  /// 某个 rank 分到的批次，样本已按划分方式补齐
  pub fn batches(&self, world_size: usize, rank: usize, layout: ShardLayout) -> Vec<ReplayBatch> {
    let indices = shard_indices(self.samples.len(), world_size, rank, layout);
    indices
      .chunks(self.batch_size)
      .map(|chunk| ReplayBatch {
        indices: chunk.to_vec(),
        samples: chunk.iter().map(|&i| self.samples[i].clone()).collect(),
      })
      .collect()
  }
}

/// 直接返回记录中的统计与预测
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayModel;

impl Model for ReplayModel {
  type Input = ReplayBatch;
  type Predictions = Vec<AnnotationRecord>;
  type Error = ReplayError;

  fn infer(&self, batch: &ReplayBatch) -> Result<ModelOutput<Self::Predictions>, Self::Error> {
    let first = batch.samples.first().ok_or(ReplayError::EmptyBatch)?;
    let num_records = first.records.len();
    let num_variants = first.predictions.len();

    let mut records = vec![BatchRecord::new(); num_records];
    let mut predictions = vec![Vec::with_capacity(batch.samples.len()); num_variants];
    for sample in &batch.samples {
      if sample.records.len() != num_records {
        return Err(ReplayError::InconsistentRecords);
      }
      if sample.predictions.len() != num_variants {
        return Err(ReplayError::InconsistentVariants);
      }
      for (acc, record) in records.iter_mut().zip(&sample.records) {
        *acc = std::mem::take(acc).combine(record);
      }
      for (list, anno) in predictions.iter_mut().zip(&sample.predictions) {
        list.push(anno.clone());
      }
    }

    Ok(ModelOutput {
      predictions,
      records,
    })
  }
}

/// 回放数据集，不提供 mAP 之类的评分，只统计各类别的检测数
#[derive(Debug, Clone)]
pub struct ReplayDataset {
  class_names: Vec<String>,
  num_samples: usize,
}

impl Dataset for ReplayDataset {
  type Batch = ReplayBatch;
  type Predictions = Vec<AnnotationRecord>;
  type Error = ReplayError;

  fn class_names(&self) -> &[String] {
    &self.class_names
  }

  fn len(&self) -> usize {
    self.num_samples
  }

  fn generate_prediction_dicts(
    &self,
    batch: &ReplayBatch,
    predictions: &Vec<AnnotationRecord>,
    _class_names: &[String],
    output_path: Option<&Path>,
  ) -> Result<Vec<AnnotationRecord>, Self::Error> {
    #[cfg(feature = "directory_record")]
    if let Some(path) = output_path {
      let output = crate::output::DirectoryRecordOutput::new(path);
      for (index, record) in batch.indices.iter().zip(predictions) {
        output.record(*index, record)?;
      }
    }
    #[cfg(not(feature = "directory_record"))]
    let _ = (batch, output_path);

    Ok(predictions.clone())
  }

  fn evaluation(
    &self,
    annotations: &[AnnotationRecord],
    class_names: &[String],
    eval_metric: &str,
    _output_path: &Path,
  ) -> Result<EvaluationResult, Self::Error> {
    let mut counts: BTreeMap<String, f64> = class_names
      .iter()
      .map(|name| (format!("count/{}", name), 0.0))
      .collect();
    for name in annotations.iter().flat_map(|a| a.name.iter()) {
      if let Some(count) = counts.get_mut(&format!("count/{}", name)) {
        *count += 1.0;
      }
    }

    let mut summary = format!(
      "回放数据集 ({} 个样本) 不计算 {} 指标, 各类别检测数:",
      annotations.len(),
      eval_metric
    );
    for (key, count) in &counts {
      summary.push_str(&format!("\n{}: {}", key, count));
    }
    Ok((summary, counts))
  }
}
