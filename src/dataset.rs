// 该文件是 Nanfeng （南风） 项目的一部分。
// src/dataset.rs - 数据集接口
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

use std::{collections::BTreeMap, path::Path};

use crate::annotation::AnnotationRecord;

/// 数据集的评估结果：可读摘要与指标表
pub type EvaluationResult = (String, BTreeMap<String, f64>);

pub trait Dataset {
  type Batch;
  type Predictions;
  type Error;

  /// 类别名称，顺序固定
  fn class_names(&self) -> &[String];

  /// 真实样本数，不含分布式填充
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 把模型输出转换为逐样本的标注，`output_path` 给出时同时落盘
  fn generate_prediction_dicts(
    &self,
    batch: &Self::Batch,
    predictions: &Self::Predictions,
    class_names: &[String],
    output_path: Option<&Path>,
  ) -> Result<Vec<AnnotationRecord>, Self::Error>;

  fn evaluation(
    &self,
    annotations: &[AnnotationRecord],
    class_names: &[String],
    eval_metric: &str,
    output_path: &Path,
  ) -> Result<EvaluationResult, Self::Error>;
}

impl<D: Dataset> Dataset for &D {
  type Batch = D::Batch;
  type Predictions = D::Predictions;
  type Error = D::Error;

  fn class_names(&self) -> &[String] {
    (**self).class_names()
  }

  fn len(&self) -> usize {
    (**self).len()
  }

  fn generate_prediction_dicts(
    &self,
    batch: &Self::Batch,
    predictions: &Self::Predictions,
    class_names: &[String],
    output_path: Option<&Path>,
  ) -> Result<Vec<AnnotationRecord>, Self::Error> {
    (**self).generate_prediction_dicts(batch, predictions, class_names, output_path)
  }

  fn evaluation(
    &self,
    annotations: &[AnnotationRecord],
    class_names: &[String],
    eval_metric: &str,
    output_path: &Path,
  ) -> Result<EvaluationResult, Self::Error> {
    (**self).evaluation(annotations, class_names, eval_metric, output_path)
  }
}
