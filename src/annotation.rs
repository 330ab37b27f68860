// 该文件是 Nanfeng （南风） 项目的一部分。
// src/annotation.rs - 检测标注记录
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

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 单个样本的检测标注
///
/// `name` 的长度即该样本检测到的目标数，其余字段由数据集决定，原样保留。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
  pub name: Vec<String>,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl AnnotationRecord {
  pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
    Self {
      name: names.into_iter().map(Into::into).collect(),
      fields: Map::new(),
    }
  }

  pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.fields.insert(key.into(), value.into());
    self
  }

  pub fn num_objects(&self) -> usize {
    self.name.len()
  }

  pub fn frame_id(&self) -> Option<&str> {
    self.fields.get("frame_id").and_then(Value::as_str)
  }
}

/// 平均每个样本的预测目标数
pub fn average_objects(annotations: &[AnnotationRecord]) -> f64 {
  let total: usize = annotations.iter().map(AnnotationRecord::num_objects).sum();
  total as f64 / annotations.len().max(1) as f64
}
