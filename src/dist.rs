// 该文件是 Nanfeng （南风） 项目的一部分。
// src/dist.rs - 多 worker 结果合并
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

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  annotation::AnnotationRecord,
  metric::{Counters, MetricError},
  sampler::ShardLayout,
};

mod file_group;
mod local;

pub use self::file_group::{DEFAULT_RUN_ID, FileGroup};
pub use self::local::LocalGroup;

pub const COORDINATOR_RANK: usize = 0;
pub const DEFAULT_MERGE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Error, Debug)]
pub enum MergeError {
  #[error("没有可合并的结果")]
  NoPartials,
  #[error("rank {rank} 超出范围 (world_size = {world_size})")]
  InvalidRank { rank: usize, world_size: usize },
  #[error("rank {0} 重复提交")]
  DuplicateRank(usize),
  #[error("计数器无法合并: {0}")]
  Metric(#[from] MetricError),
  #[error("rank {rank} 的预测分支数为 {actual}, 期望 {expected}")]
  VariantMismatch {
    rank: usize,
    expected: usize,
    actual: usize,
  },
  #[error("合并后样本不足: 期望 {expected}, 实际 {actual}")]
  MissingSamples { expected: usize, actual: usize },
  #[error("等待合并超时 ({timeout:?}), 未响应的 rank: {missing:?}")]
  MergeTimeout {
    missing: Vec<usize>,
    timeout: Duration,
  },
  #[error("worker 通道已断开")]
  Disconnected,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerdeError(#[from] serde_json::Error),
  #[error("局部结果属于运行 {actual}, 期望 {expected}")]
  RunMismatch { expected: String, actual: String },
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
}

/// 单个 worker 在评估结束时的局部结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPartial {
  pub rank: usize,
  pub counters: Counters,
  /// 每个预测分支一条标注序列，保持该 worker 内的顺序
  pub annotations: Vec<Vec<AnnotationRecord>>,
}

impl WorkerPartial {
  pub fn num_samples(&self) -> usize {
    self.annotations.first().map_or(0, Vec::len)
  }
}

/// 协调者得到的全局结果
#[derive(Debug, Clone, PartialEq)]
pub struct MergedResult {
  pub counters: Counters,
  pub annotations: Vec<Vec<AnnotationRecord>>,
}

/// 合并各 worker 的局部结果
///
/// 计数器逐键整数相加；标注按划分方式还原为数据集顺序后截断到 `total_samples`，
/// 以丢弃填充带来的重复样本。
pub fn merge(
  mut partials: Vec<WorkerPartial>,
  total_samples: usize,
  layout: ShardLayout,
) -> Result<MergedResult, MergeError> {
  let world_size = partials.len();
  let mut seen = vec![false; world_size];
  for partial in &partials {
    if partial.rank >= world_size {
      return Err(MergeError::InvalidRank {
        rank: partial.rank,
        world_size,
      });
    }
    if std::mem::replace(&mut seen[partial.rank], true) {
      return Err(MergeError::DuplicateRank(partial.rank));
    }
  }
  partials.sort_by_key(|p| p.rank);

  // 没有处理过任何批次的 worker 没有分支列表，视为每个分支都为空
  let num_variants = partials.iter().map(|p| p.annotations.len()).max().unwrap_or(0);
  for partial in &partials {
    if !partial.annotations.is_empty() && partial.annotations.len() != num_variants {
      return Err(MergeError::VariantMismatch {
        rank: partial.rank,
        expected: num_variants,
        actual: partial.annotations.len(),
      });
    }
  }

  let mut iter = partials.into_iter();
  let first = iter.next().ok_or(MergeError::NoPartials)?;
  let mut counters = first.counters;
  let mut per_rank = vec![first.annotations];
  for partial in iter {
    counters.merge_from(&partial.counters)?;
    per_rank.push(partial.annotations);
  }

  // 没有任何 worker 提交分支列表时，只有空数据集才能合并
  if num_variants == 0 && total_samples > 0 {
    return Err(MergeError::MissingSamples {
      expected: total_samples,
      actual: 0,
    });
  }

  let mut annotations = Vec::with_capacity(num_variants);
  for variant in 0..num_variants {
    let lists: Vec<Vec<AnnotationRecord>> = per_rank
      .iter_mut()
      .map(|lists| lists.get_mut(variant).map(std::mem::take).unwrap_or_default())
      .collect();
    let mut ordered = match layout {
      ShardLayout::Strided => interleave(lists),
      ShardLayout::Contiguous => lists.into_iter().flatten().collect(),
    };
    if ordered.len() < total_samples {
      return Err(MergeError::MissingSamples {
        expected: total_samples,
        actual: ordered.len(),
      });
    }
    debug!(
      "分支 {}: 合并 {} 条标注, 截断到 {}",
      variant,
      ordered.len(),
      total_samples
    );
    ordered.truncate(total_samples);
    annotations.push(ordered);
  }

  Ok(MergedResult {
    counters,
    annotations,
  })
}

/// 按 rank 轮流取出，已取完的 rank 跳过
fn interleave<T>(lists: Vec<Vec<T>>) -> Vec<T> {
  let capacity = lists.iter().map(Vec::len).sum();
  let mut iters: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
  let mut ordered = Vec::with_capacity(capacity);
  loop {
    let before = ordered.len();
    for it in iters.iter_mut() {
      if let Some(item) = it.next() {
        ordered.push(item);
      }
    }
    if ordered.len() == before {
      break;
    }
  }
  ordered
}

/// 汇集各 worker 局部结果的屏障，只能使用一次
pub trait Collective {
  fn rank(&self) -> usize;

  fn world_size(&self) -> usize;

  fn is_coordinator(&self) -> bool {
    self.rank() == COORDINATOR_RANK
  }

  /// 协调者返回按 rank 排列的全部局部结果，其余 worker 只负责发送并返回 `None`
  fn gather(&self, partial: WorkerPartial) -> Result<Option<Vec<WorkerPartial>>, MergeError>;
}

impl<C: Collective> Collective for &C {
  fn rank(&self) -> usize {
    (**self).rank()
  }

  fn world_size(&self) -> usize {
    (**self).world_size()
  }

  fn gather(&self, partial: WorkerPartial) -> Result<Option<Vec<WorkerPartial>>, MergeError> {
    (**self).gather(partial)
  }
}

/// 单进程评估，合并阶段直接透传
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
  fn rank(&self) -> usize {
    COORDINATOR_RANK
  }

  fn world_size(&self) -> usize {
    1
  }

  fn gather(&self, partial: WorkerPartial) -> Result<Option<Vec<WorkerPartial>>, MergeError> {
    Ok(Some(vec![partial]))
  }
}

impl FromUrlWithScheme for SingleProcess {
  const SCHEME: &'static str = "single";
}

impl FromUrl for SingleProcess {
  type Error = MergeError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(MergeError::SchemeMismatch);
    }
    Ok(SingleProcess)
  }
}

pub enum CollectiveWrapper {
  SingleProcess(SingleProcess),
  FileGroup(FileGroup),
}

impl FromUrl for CollectiveWrapper {
  type Error = MergeError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SingleProcess::SCHEME => Ok(CollectiveWrapper::SingleProcess(SingleProcess::from_url(
        url,
      )?)),
      FileGroup::SCHEME => Ok(CollectiveWrapper::FileGroup(FileGroup::from_url(url)?)),
      _ => Err(MergeError::SchemeMismatch),
    }
  }
}

impl Collective for CollectiveWrapper {
  fn rank(&self) -> usize {
    match self {
      CollectiveWrapper::SingleProcess(c) => c.rank(),
      CollectiveWrapper::FileGroup(c) => c.rank(),
    }
  }

  fn world_size(&self) -> usize {
    match self {
      CollectiveWrapper::SingleProcess(c) => c.world_size(),
      CollectiveWrapper::FileGroup(c) => c.world_size(),
    }
  }

  fn gather(&self, partial: WorkerPartial) -> Result<Option<Vec<WorkerPartial>>, MergeError> {
    match self {
      CollectiveWrapper::SingleProcess(c) => c.gather(partial),
      CollectiveWrapper::FileGroup(c) => c.gather(partial),
    }
  }
}

/// 找出尚未提交结果的 rank
fn missing_ranks(received: &[bool]) -> Vec<usize> {
  received
    .iter()
    .enumerate()
    .filter(|(_, ok)| !**ok)
    .map(|(rank, _)| rank)
    .collect()
}
