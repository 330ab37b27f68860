// 该文件是 Nanfeng （南风） 项目的一部分。
// src/sampler.rs - 分布式样本划分
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

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 样本在各 worker 之间的划分方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardLayout {
  /// rank r 处理 r, r+W, r+2W, ...
  #[default]
  Strided,
  /// rank r 处理第 r 个连续块
  Contiguous,
}

impl FromStr for ShardLayout {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "strided" => Ok(ShardLayout::Strided),
      "contiguous" => Ok(ShardLayout::Contiguous),
      other => Err(format!("未知的划分方式: {}", other)),
    }
  }
}

/// 每个 worker 分到的样本数（含填充）
pub fn shard_len(total: usize, world_size: usize) -> usize {
  total.div_ceil(world_size.max(1))
}

/// 计算某个 rank 分到的样本下标
///
/// 下标列表先从头部循环补齐到 world_size 的整数倍，所有 rank 的样本数相同，
/// 补出的重复样本在合并时按总数截断。
pub fn shard_indices(
  total: usize,
  world_size: usize,
  rank: usize,
  layout: ShardLayout,
) -> Vec<usize> {
  let world_size = world_size.max(1);
  if total == 0 || rank >= world_size {
    return Vec::new();
  }
  let per_rank = shard_len(total, world_size);
  let padded: Vec<usize> = (0..per_rank * world_size).map(|i| i % total).collect();

  match layout {
    ShardLayout::Strided => padded.into_iter().skip(rank).step_by(world_size).collect(),
    ShardLayout::Contiguous => padded[rank * per_rank..(rank + 1) * per_rank].to_vec(),
  }
}
