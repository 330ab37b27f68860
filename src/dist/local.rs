// 该文件是 Nanfeng （南风） 项目的一部分。
// src/dist/local.rs - 进程内 worker 组
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
  sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
  time::{Duration, Instant},
};

use tracing::{debug, error, info};

use crate::dist::{COORDINATOR_RANK, Collective, MergeError, WorkerPartial, missing_ranks};

/// 同一进程内的一组 worker，每个 worker 通常运行在自己的线程上
///
/// 非协调者把局部结果发送给协调者；协调者在超时前收齐全部 rank。
pub struct LocalGroup {
  rank: usize,
  world_size: usize,
  sender: Sender<WorkerPartial>,
  receiver: Option<Receiver<WorkerPartial>>,
  timeout: Duration,
}

impl LocalGroup {
  /// 创建 `world_size` 个句柄，下标即 rank
  pub fn new(world_size: usize, timeout: Duration) -> Vec<LocalGroup> {
    let world_size = world_size.max(1);
    let (tx, rx) = mpsc::channel();
    let mut receiver = Some(rx);
    (0..world_size)
      .map(|rank| LocalGroup {
        rank,
        world_size,
        sender: tx.clone(),
        receiver: if rank == COORDINATOR_RANK {
          receiver.take()
        } else {
          None
        },
        timeout,
      })
      .collect()
  }
}

impl Collective for LocalGroup {
  fn rank(&self) -> usize {
    self.rank
  }

  fn world_size(&self) -> usize {
    self.world_size
  }

  fn gather(&self, partial: WorkerPartial) -> Result<Option<Vec<WorkerPartial>>, MergeError> {
    let Some(receiver) = &self.receiver else {
      debug!("rank {} 发送局部结果", self.rank);
      self
        .sender
        .send(partial)
        .map_err(|_| MergeError::Disconnected)?;
      return Ok(None);
    };

    let mut received = vec![false; self.world_size];
    let mut partials = Vec::with_capacity(self.world_size);
    received[self.rank] = true;
    partials.push(partial);

    let deadline = Instant::now() + self.timeout;
    while partials.len() < self.world_size {
      let remaining = deadline.saturating_duration_since(Instant::now());
      match receiver.recv_timeout(remaining) {
        Ok(partial) => {
          if partial.rank >= self.world_size {
            return Err(MergeError::InvalidRank {
              rank: partial.rank,
              world_size: self.world_size,
            });
          }
          if std::mem::replace(&mut received[partial.rank], true) {
            return Err(MergeError::DuplicateRank(partial.rank));
          }
          debug!("收到 rank {} 的局部结果", partial.rank);
          partials.push(partial);
        }
        Err(RecvTimeoutError::Timeout) => {
          let missing = missing_ranks(&received);
          error!("等待合并超时, 未响应的 rank: {:?}", missing);
          return Err(MergeError::MergeTimeout {
            missing,
            timeout: self.timeout,
          });
        }
        Err(RecvTimeoutError::Disconnected) => return Err(MergeError::Disconnected),
      }
    }

    partials.sort_by_key(|p| p.rank);
    info!("已收齐 {} 个 worker 的局部结果", partials.len());
    Ok(Some(partials))
  }
}
