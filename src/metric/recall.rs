// 该文件是 Nanfeng （南风） 项目的一部分。
// src/metric/recall.rs - 召回率计算
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

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::metric::{Band, ClassFilter, CounterSet, Stage, Threshold};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecallEntry {
  pub stage: Stage,
  pub threshold: Threshold,
  pub class: ClassFilter,
  pub ratio: f64,
}

/// 各类别、各阶段、各阈值的召回率
#[derive(Debug, Clone, PartialEq)]
pub struct RecallBreakdown {
  entries: Vec<RecallEntry>,
}

impl RecallBreakdown {
  /// 分母为 0 时按 1 处理，结果为 0
  pub fn compute(counters: &CounterSet) -> Self {
    let mut entries = Vec::with_capacity(ClassFilter::ALL.len() * counters.thresholds().len() * 2);
    for class in ClassFilter::ALL {
      let gt = counters.ground_truth(class).max(1) as f64;
      for &threshold in counters.thresholds() {
        for stage in Stage::ALL {
          entries.push(RecallEntry {
            stage,
            threshold,
            class,
            ratio: counters.recall(stage, threshold, class) as f64 / gt,
          });
        }
      }
    }
    Self { entries }
  }

  pub fn entries(&self) -> &[RecallEntry] {
    &self.entries
  }

  pub fn ratio(&self, stage: Stage, threshold: Threshold, class: ClassFilter) -> Option<f64> {
    self
      .entries
      .iter()
      .find(|e| e.stage == stage && e.threshold == threshold && e.class == class)
      .map(|e| e.ratio)
  }

  /// 只保留不区分类别的条目
  pub fn coarse_table(&self) -> RecallTable {
    let mut table = RecallTable::default();
    for entry in self.entries.iter().filter(|e| e.class == ClassFilter::All) {
      table.insert(entry.stage, entry.threshold, entry.ratio);
    }
    table
  }

  pub fn log(&self, band: Option<Band>) {
    if let Some(band) = band {
      info!("{}", band);
    }
    for class in ClassFilter::ALL {
      info!("{}", class.display_name());
      for entry in self.entries.iter().filter(|e| e.class == class) {
        info!(
          "recall_{}_{}{}: {:.6}",
          entry.stage,
          entry.threshold,
          class.suffix(),
          entry.ratio
        );
      }
    }
  }
}

/// 最终对外的召回率表，键为 `recall/<stage>_<threshold>`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RecallTable {
  ratios: BTreeMap<String, f64>,
}

impl RecallTable {
  pub fn key(stage: Stage, threshold: Threshold) -> String {
    format!("recall/{}_{}", stage, threshold)
  }

  fn insert(&mut self, stage: Stage, threshold: Threshold, ratio: f64) {
    self.ratios.insert(Self::key(stage, threshold), ratio);
  }

  pub fn get(&self, stage: Stage, threshold: Threshold) -> Option<f64> {
    self.ratios.get(&Self::key(stage, threshold)).copied()
  }

  pub fn len(&self) -> usize {
    self.ratios.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ratios.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
    self.ratios.iter()
  }

  /// 附加分段名后的键，例如 `recall/near/roi_0.3`
  pub fn with_band_prefix(&self, band: Band) -> impl Iterator<Item = (String, f64)> {
    let band = band.name().to_lowercase();
    self.ratios.iter().map(move |(key, ratio)| {
      let rest = key.strip_prefix("recall/").unwrap_or(key);
      (format!("recall/{}/{}", band, rest), *ratio)
    })
  }
}

impl IntoIterator for RecallTable {
  type Item = (String, f64);
  type IntoIter = std::collections::btree_map::IntoIter<String, f64>;

  fn into_iter(self) -> Self::IntoIter {
    self.ratios.into_iter()
  }
}

/// 计算并记录全部召回率，只返回不区分类别的部分
pub fn reduce(counters: &CounterSet) -> RecallTable {
  let breakdown = RecallBreakdown::compute(counters);
  breakdown.log(None);
  breakdown.coarse_table()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::metric::BatchRecord;

  #[test]
  fn test_coarse_table_only_has_class_agnostic_keys() {
    let thresholds: Vec<Threshold> = [0.3, 0.5].into_iter().filter_map(Threshold::new).collect();
    let mut set = CounterSet::new(&thresholds);
    set.accumulate(&BatchRecord::new().with("roi_0.3", 1).with("gt", 2));
    let table = reduce(&set);
    assert_eq!(table.len(), 4);
    assert!(table.iter().all(|(k, _)| k.starts_with("recall/")));
    assert_eq!(table.get(Stage::Roi, thresholds[0]), Some(0.5));
  }

  #[test]
  fn test_band_prefix() {
    let t = Threshold::new(0.7).unwrap();
    let table = RecallBreakdown::compute(&CounterSet::new(&[t])).coarse_table();
    let keys: Vec<String> = table.with_band_prefix(Band::Near).map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["recall/near/rcnn_0.7", "recall/near/roi_0.7"]);
  }

  #[test]
  fn test_integral_threshold_key() {
    let t = Threshold::new(1.0).unwrap();
    let mut set = CounterSet::new(&[t]);
    set.accumulate(&BatchRecord::new().with("rcnn_1.0", 1).with("gt", 4));
    let table = reduce(&set);
    let keys: Vec<&String> = table.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, ["recall/rcnn_1.0", "recall/roi_1.0"]);
    assert_eq!(table.get(Stage::Rcnn, t), Some(0.25));
  }
}
