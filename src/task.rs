// 该文件是 Nanfeng （南风） 项目的一部分。
// src/task.rs - 评估流程
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

use std::{collections::BTreeMap, time::Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  annotation::{AnnotationRecord, average_objects},
  config::{ConfigError, EvalConfig},
  dataset::Dataset,
  dist::{Collective, MergeError, WorkerPartial, merge},
  metric::{Band, Counters, MetricError, RecallBreakdown},
  model::Model,
  output::ResultWriter,
};

/// 冒烟测试时最多处理的批次数
pub const SMOKE_TEST_BATCHES: usize = 10;
/// 同时评估的预测分支上限
pub const MAX_PREDICTION_VARIANTS: usize = 4;

pub type ResultTable = BTreeMap<String, f64>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum EvalError {
  #[error("配置错误: {0}")]
  ConfigError(#[from] ConfigError),
  #[error("计数器错误: {0}")]
  MetricError(#[from] MetricError),
  #[error("合并错误: {0}")]
  MergeError(#[from] MergeError),
  #[error("模型推理错误: {0}")]
  ModelError(BoxError),
  #[error("数据集错误: {0}")]
  DatasetError(BoxError),
  #[error("结果输出错误: {0}")]
  OutputError(BoxError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("预测分支数 {0} 不在 1..=4 内")]
  InvalidVariantCount(usize),
  #[error("预测分支数从 {expected} 变为 {actual}")]
  VariantCountChanged { expected: usize, actual: usize },
  #[error("评估已经开始过, 当前状态: {0:?}")]
  AlreadyStarted(EvalState),
}

/// 评估流程的状态，只能依次前进
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalState {
  Idle,
  Running,
  Merging,
  Reducing,
  Reporting,
  Done,
}

impl EvalState {
  pub fn next(self) -> Option<EvalState> {
    match self {
      EvalState::Idle => Some(EvalState::Running),
      EvalState::Running => Some(EvalState::Merging),
      EvalState::Merging => Some(EvalState::Reducing),
      EvalState::Reducing => Some(EvalState::Reporting),
      EvalState::Reporting => Some(EvalState::Done),
      EvalState::Done => None,
    }
  }
}

/// 一次完整的评估
///
/// 每个 worker 各自持有一个任务。只有协调者得到非空的结果表，
/// 并负责输出召回率日志与标注文件。
#[derive(Debug)]
pub struct EvalTask {
  config: EvalConfig,
  state: EvalState,
}

impl EvalTask {
  pub fn new(config: EvalConfig) -> Self {
    Self {
      config,
      state: EvalState::Idle,
    }
  }

  pub fn config(&self) -> &EvalConfig {
    &self.config
  }

  pub fn state(&self) -> EvalState {
    self.state
  }

  fn advance(&mut self) {
    if let Some(next) = self.state.next() {
      debug!("评估状态: {:?} -> {:?}", self.state, next);
      self.state = next;
    }
  }

  pub fn run<I, M, D, C, O>(
    &mut self,
    batches: I,
    model: M,
    dataset: D,
    collective: C,
    output: O,
  ) -> Result<ResultTable, EvalError>
  where
    I: IntoIterator<Item = D::Batch>,
    D: Dataset,
    D::Error: std::error::Error + Send + Sync + 'static,
    M: Model<Input = D::Batch, Predictions = D::Predictions>,
    M::Error: std::error::Error + Send + Sync + 'static,
    C: Collective,
    O: ResultWriter,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    if self.state != EvalState::Idle {
      return Err(EvalError::AlreadyStarted(self.state));
    }
    self.config.validate()?;

    let config = self.config.clone();
    let rank = collective.rank();
    let is_coordinator = collective.is_coordinator();

    std::fs::create_dir_all(&config.result_dir)?;
    let final_output_dir = config.final_output_dir();
    if config.save_to_file {
      std::fs::create_dir_all(&final_output_dir)?;
    }

    let class_names = dataset.class_names().to_vec();
    let mut counters = Counters::new(&config.recall_thresholds, config.eval_by_range);
    let mut annotations: Vec<Vec<AnnotationRecord>> = Vec::new();

    info!(
      "*************** EPOCH {} EVALUATION *****************",
      config.epoch_id
    );

    self.advance();
    let start = Instant::now();
    for (index, batch) in batches.into_iter().enumerate() {
      let inferred = model
        .infer(&batch)
        .map_err(|e| EvalError::ModelError(Box::new(e)))?;
      counters.accumulate(&inferred.records)?;

      let num_variants = inferred.predictions.len();
      if num_variants == 0 || num_variants > MAX_PREDICTION_VARIANTS {
        return Err(EvalError::InvalidVariantCount(num_variants));
      }
      if annotations.is_empty() {
        annotations = vec![Vec::new(); num_variants];
      } else if annotations.len() != num_variants {
        return Err(EvalError::VariantCountChanged {
          expected: annotations.len(),
          actual: num_variants,
        });
      }

      let output_path = config.save_to_file.then_some(final_output_dir.as_path());
      for (list, predictions) in annotations.iter_mut().zip(&inferred.predictions) {
        let annos = dataset
          .generate_prediction_dicts(&batch, predictions, &class_names, output_path)
          .map_err(|e| EvalError::DatasetError(Box::new(e)))?;
        list.extend(annos);
      }

      if is_coordinator && let Some((key, value)) = counters.overall().progress_summary() {
        debug!("eval [{}] {}: {}", index + 1, key, value);
      }
      if config.smoke_test && index + 1 >= SMOKE_TEST_BATCHES {
        warn!("冒烟测试, 处理 {} 个批次后提前结束", index + 1);
        break;
      }
    }

    self.advance();
    let partial = WorkerPartial {
      rank,
      counters,
      annotations,
    };
    let gathered = collective.gather(partial)?;

    info!(
      "*************** Performance of EPOCH {} *****************",
      config.epoch_id
    );
    let sec_per_example = start.elapsed().as_secs_f64() / dataset.len().max(1) as f64;
    info!("生成标注完成 (每样本耗时: {:.4} 秒)", sec_per_example);

    let merged = match gathered.filter(|_| is_coordinator) {
      Some(partials) => {
        // 冒烟测试只处理了部分样本，按实际收集到的数量截断
        let total = if config.smoke_test {
          partials
            .iter()
            .map(WorkerPartial::num_samples)
            .sum::<usize>()
            .min(dataset.len())
        } else {
          dataset.len()
        };
        Some(merge(partials, total, config.shard_layout)?)
      }
      None => None,
    };

    self.advance();
    let Some(merged) = merged else {
      self.advance();
      self.advance();
      return Ok(ResultTable::new());
    };

    let breakdowns: Vec<(Option<Band>, RecallBreakdown)> = merged
      .counters
      .bands()
      .into_iter()
      .map(|(band, set)| (band, RecallBreakdown::compute(set)))
      .collect();

    let mut table = ResultTable::new();
    for (band, breakdown) in &breakdowns {
      let coarse = breakdown.coarse_table();
      match band {
        None | Some(Band::All) => table.extend(coarse),
        Some(band) => table.extend(coarse.with_band_prefix(*band)),
      }
    }

    self.advance();
    for (band, breakdown) in &breakdowns {
      breakdown.log(*band);
    }

    // 空数据集没有分支列表，仍按一个空分支输出并评估
    let variants = if merged.annotations.is_empty() {
      vec![Vec::new()]
    } else {
      merged.annotations
    };
    for (variant, annos) in variants.iter().enumerate() {
      output
        .write_annotations(variant, annos)
        .map_err(|e| EvalError::OutputError(Box::new(e)))?;
      info!(
        "平均预测目标数 ({} 个样本): {:.3}",
        annos.len(),
        average_objects(annos)
      );

      let (summary, result) = dataset
        .evaluation(annos, &class_names, &config.eval_metric, &final_output_dir)
        .map_err(|e| EvalError::DatasetError(Box::new(e)))?;
      info!("{}", summary);
      for (key, value) in result {
        let key = if variant == 0 {
          key
        } else {
          format!("variant_{}/{}", variant, key)
        };
        table.insert(key, value);
      }
    }

    info!("结果保存在 {}", config.result_dir.display());
    info!("****************Evaluation done.*****************");
    self.advance();
    Ok(table)
  }
}
