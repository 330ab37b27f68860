// 该文件是 Nanfeng （南风） 项目的一部分。
// src/metric/range.rs - 按距离分段的计数器
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

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metric::{BatchRecord, CounterSet, MetricError, Threshold};

pub const BAND_COUNT: usize = 4;

/// 距离分段，`All` 是其余三段的并集
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
  All,
  Near,
  Mid,
  Far,
}

impl Band {
  pub const ALL: [Band; BAND_COUNT] = [Band::All, Band::Near, Band::Mid, Band::Far];

  pub fn name(&self) -> &'static str {
    match self {
      Band::All => "All",
      Band::Near => "Near",
      Band::Mid => "Mid",
      Band::Far => "Far",
    }
  }

  pub fn index(&self) -> usize {
    *self as usize
  }
}

impl fmt::Display for Band {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// 四个分段各自持有一组计数器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeBuckets {
  buckets: [CounterSet; BAND_COUNT],
}

impl RangeBuckets {
  pub fn new(thresholds: &[Threshold]) -> Self {
    Self {
      buckets: std::array::from_fn(|_| CounterSet::new(thresholds)),
    }
  }

  pub fn band(&self, band: Band) -> &CounterSet {
    &self.buckets[band.index()]
  }

  pub fn iter(&self) -> impl Iterator<Item = (Band, &CounterSet)> {
    Band::ALL.into_iter().zip(self.buckets.iter())
  }

  /// 第 i 条批次统计累加到第 i 个分段，条数必须恰好为 4
  pub fn accumulate(&mut self, records: &[BatchRecord]) -> Result<(), MetricError> {
    if records.len() != BAND_COUNT {
      return Err(MetricError::BucketCountMismatch {
        expected: BAND_COUNT,
        actual: records.len(),
      });
    }
    for (bucket, record) in self.buckets.iter_mut().zip(records) {
      bucket.accumulate(record);
    }
    Ok(())
  }

  pub fn merge_from(&mut self, other: &RangeBuckets) -> Result<(), MetricError> {
    for (bucket, other) in self.buckets.iter_mut().zip(other.buckets.iter()) {
      bucket.merge_from(other)?;
    }
    Ok(())
  }
}

/// 一个 worker 的全部计数器：不分段或按距离分段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Counters {
  Single(CounterSet),
  Ranged(RangeBuckets),
}

impl Counters {
  pub fn new(thresholds: &[Threshold], by_range: bool) -> Self {
    if by_range {
      Counters::Ranged(RangeBuckets::new(thresholds))
    } else {
      Counters::Single(CounterSet::new(thresholds))
    }
  }

  /// 不分段时只使用第一条统计
  pub fn accumulate(&mut self, records: &[BatchRecord]) -> Result<(), MetricError> {
    match self {
      Counters::Single(set) => {
        let record = records.first().ok_or(MetricError::EmptyBatchRecords)?;
        set.accumulate(record);
        Ok(())
      }
      Counters::Ranged(buckets) => buckets.accumulate(records),
    }
  }

  pub fn merge_from(&mut self, other: &Counters) -> Result<(), MetricError> {
    match (self, other) {
      (Counters::Single(a), Counters::Single(b)) => a.merge_from(b),
      (Counters::Ranged(a), Counters::Ranged(b)) => a.merge_from(b),
      _ => Err(MetricError::ShapeMismatch),
    }
  }

  /// 覆盖全部目标的计数器，分段时为 `All`
  pub fn overall(&self) -> &CounterSet {
    match self {
      Counters::Single(set) => set,
      Counters::Ranged(buckets) => buckets.band(Band::All),
    }
  }

  /// 按报告顺序列出各分段，不分段时分段为 `None`
  pub fn bands(&self) -> Vec<(Option<Band>, &CounterSet)> {
    match self {
      Counters::Single(set) => vec![(None, set)],
      Counters::Ranged(buckets) => buckets.iter().map(|(band, set)| (Some(band), set)).collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::metric::{ClassFilter, Stage};

  fn thresholds() -> Vec<Threshold> {
    vec![Threshold::new(0.5).unwrap()]
  }

  #[test]
  fn test_ranged_requires_four_records() {
    let mut buckets = RangeBuckets::new(&thresholds());
    let err = buckets.accumulate(&[BatchRecord::new(), BatchRecord::new()]);
    assert_eq!(
      err,
      Err(MetricError::BucketCountMismatch {
        expected: 4,
        actual: 2
      })
    );
  }

  #[test]
  fn test_ranged_accumulates_per_band() {
    let mut buckets = RangeBuckets::new(&thresholds());
    let records: Vec<BatchRecord> = (0..4u64)
      .map(|i| BatchRecord::new().with("gt", i + 1))
      .collect();
    buckets.accumulate(&records).unwrap();
    for band in Band::ALL {
      assert_eq!(
        buckets.band(band).ground_truth(ClassFilter::All),
        band.index() as u64 + 1
      );
    }
  }

  #[test]
  fn test_single_uses_first_record() {
    let mut counters = Counters::new(&thresholds(), false);
    counters
      .accumulate(&[
        BatchRecord::new().with("roi_0.5", 1),
        BatchRecord::new().with("roi_0.5", 10),
      ])
      .unwrap();
    let t = Threshold::new(0.5).unwrap();
    assert_eq!(counters.overall().recall(Stage::Roi, t, ClassFilter::All), 1);
    assert_eq!(counters.accumulate(&[]), Err(MetricError::EmptyBatchRecords));
  }

  #[test]
  fn test_merge_shape_mismatch() {
    let mut single = Counters::new(&thresholds(), false);
    let ranged = Counters::new(&thresholds(), true);
    assert_eq!(single.merge_from(&ranged), Err(MetricError::ShapeMismatch));
  }
}
