// 该文件是 Nanfeng （南风） 项目的一部分。
// src/dist/file_group.rs - 基于共享目录的结果合并
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
  collections::HashMap,
  fs,
  path::{Path, PathBuf},
  thread,
  time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  dist::{
    COORDINATOR_RANK, Collective, DEFAULT_MERGE_TIMEOUT, MergeError, WorkerPartial, missing_ranks,
  },
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_RUN_ID: &str = "default";

/// 多进程共享一个目录完成合并
///
/// 每个 rank 把局部结果写成 `part_<run>_<rank>.json`，协调者轮询直到本次运行的
/// 文件收齐或超时，读取后删除这些文件。不同运行的文件互不可见，
/// 同一目录下不能同时进行两个相同 `run` 的评估。
#[derive(Debug, Clone)]
pub struct FileGroup {
  directory: PathBuf,
  rank: usize,
  world_size: usize,
  timeout: Duration,
  run: String,
}

/// 落盘的局部结果，带上所属运行的标识
#[derive(Serialize, Deserialize)]
struct PartFile {
  run: String,
  partial: WorkerPartial,
}

fn valid_run_id(run: &str) -> bool {
  !run.is_empty()
    && run
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl FileGroup {
  pub fn new(
    directory: impl Into<PathBuf>,
    rank: usize,
    world_size: usize,
    timeout: Duration,
  ) -> Result<Self, MergeError> {
    if world_size == 0 || rank >= world_size {
      return Err(MergeError::InvalidRank { rank, world_size });
    }
    Ok(Self {
      directory: directory.into(),
      rank,
      world_size,
      timeout,
      run: DEFAULT_RUN_ID.to_string(),
    })
  }

  /// 本次运行的标识，所有 rank 必须一致，只能包含字母、数字与 `-_.`
  pub fn with_run(mut self, run: impl Into<String>) -> Result<Self, MergeError> {
    let run = run.into();
    if !valid_run_id(&run) {
      return Err(MergeError::InvalidParameter {
        key: "run".to_string(),
        value: run,
      });
    }
    self.run = run;
    Ok(self)
  }

  pub fn run(&self) -> &str {
    &self.run
  }

  fn part_path(&self, rank: usize) -> PathBuf {
    self
      .directory
      .join(format!("part_{}_{}.json", self.run, rank))
  }

  fn write_part(&self, partial: WorkerPartial) -> Result<(), MergeError> {
    fs::create_dir_all(&self.directory)?;
    let path = self.part_path(self.rank);
    let part = PartFile {
      run: self.run.clone(),
      partial,
    };
    // 先写临时文件再改名，协调者不会读到写了一半的文件
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(&part)?)?;
    fs::rename(&tmp, &path)?;
    debug!("rank {} 已写入局部结果: {}", self.rank, path.display());
    Ok(())
  }

  fn read_part(&self, path: &Path) -> Result<WorkerPartial, MergeError> {
    let data = fs::read(path)?;
    let part: PartFile = serde_json::from_slice(&data)?;
    if part.run != self.run {
      return Err(MergeError::RunMismatch {
        expected: self.run.clone(),
        actual: part.run,
      });
    }
    Ok(part.partial)
  }

  /// 删除本次运行留下的文件，目录为空时一并删除
  fn cleanup(&self) {
    for rank in 0..self.world_size {
      let path = self.part_path(rank);
      if path.exists()
        && let Err(e) = fs::remove_file(&path)
      {
        warn!("删除 {} 失败: {}", path.display(), e);
      }
    }
    let _ = fs::remove_dir(&self.directory);
  }
}

impl FromUrlWithScheme for FileGroup {
  const SCHEME: &'static str = "tmpdir";
}

impl FromUrl for FileGroup {
  type Error = MergeError;

  /// `tmpdir:///path/to/tmpdir?rank=0&world_size=4&timeout=1800&run=epoch80`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(MergeError::SchemeMismatch);
    }

    let query_pairs: HashMap<_, _> = url.query_pairs().collect();
    let parse = |key: &str| -> Result<Option<u64>, MergeError> {
      query_pairs
        .get(key)
        .map(|v| {
          v.parse::<u64>().map_err(|_| MergeError::InvalidParameter {
            key: key.to_string(),
            value: v.to_string(),
          })
        })
        .transpose()
    };

    let rank = parse("rank")?.unwrap_or(0) as usize;
    let world_size = parse("world_size")?.unwrap_or(1) as usize;
    let timeout = parse("timeout")?
      .map(Duration::from_secs)
      .unwrap_or(DEFAULT_MERGE_TIMEOUT);

    let group = FileGroup::new(url.path(), rank, world_size, timeout)?;
    match query_pairs.get("run") {
      Some(run) => group.with_run(run.as_ref()),
      None => Ok(group),
    }
  }
}

impl Collective for FileGroup {
  fn rank(&self) -> usize {
    self.rank
  }

  fn world_size(&self) -> usize {
    self.world_size
  }

  fn gather(&self, partial: WorkerPartial) -> Result<Option<Vec<WorkerPartial>>, MergeError> {
    self.write_part(partial)?;
    if self.rank != COORDINATOR_RANK {
      return Ok(None);
    }

    let deadline = Instant::now() + self.timeout;
    let mut received = vec![false; self.world_size];
    loop {
      for (rank, ok) in received.iter_mut().enumerate() {
        if !*ok {
          *ok = self.part_path(rank).exists();
        }
      }
      if received.iter().all(|ok| *ok) {
        break;
      }
      if Instant::now() >= deadline {
        let missing = missing_ranks(&received);
        error!("等待合并超时, 未响应的 rank: {:?}", missing);
        // 超时的文件不能留给下一次同名运行
        self.cleanup();
        return Err(MergeError::MergeTimeout {
          missing,
          timeout: self.timeout,
        });
      }
      thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }

    let mut partials = Vec::with_capacity(self.world_size);
    for rank in 0..self.world_size {
      let partial = self.read_part(&self.part_path(rank))?;
      if partial.rank != rank {
        return Err(MergeError::InvalidRank {
          rank: partial.rank,
          world_size: self.world_size,
        });
      }
      partials.push(partial);
    }

    self.cleanup();
    info!("已收齐 {} 个 worker 的局部结果", partials.len());
    Ok(Some(partials))
  }
}
