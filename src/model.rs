// 该文件是 Nanfeng （南风） 项目的一部分。
// src/model.rs - 模型接口
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::metric::BatchRecord;

/// 模型对一个批次的输出
#[derive(Debug, Clone)]
pub struct ModelOutput<P> {
  /// 各预测分支的结果，至少一个
  pub predictions: Vec<P>,
  /// 批次召回统计，按距离分段时为 4 条
  pub records: Vec<BatchRecord>,
}

pub trait Model {
  type Input;
  type Predictions;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<ModelOutput<Self::Predictions>, Self::Error>;
}

impl<M: Model> Model for &M {
  type Input = M::Input;
  type Predictions = M::Predictions;
  type Error = M::Error;

  fn infer(&self, input: &Self::Input) -> Result<ModelOutput<Self::Predictions>, Self::Error> {
    (**self).infer(input)
  }
}
