// 该文件是 Nanfeng （南风） 项目的一部分。
// src/metric.rs - 召回计数器
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
  cmp::Ordering,
  collections::{BTreeMap, HashMap},
  fmt,
  hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod range;
mod recall;

pub use self::range::{BAND_COUNT, Band, Counters, RangeBuckets};
pub use self::recall::{RecallBreakdown, RecallEntry, RecallTable, reduce};

#[derive(Error, Debug, PartialEq)]
pub enum MetricError {
  #[error("分段数量不匹配: 期望 {expected}, 实际 {actual}")]
  BucketCountMismatch { expected: usize, actual: usize },
  #[error("模型没有返回任何批次统计")]
  EmptyBatchRecords,
  #[error("计数器形状不一致")]
  ShapeMismatch,
}

/// 检测阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
  /// 候选框阶段
  Roi,
  /// 精修阶段
  Rcnn,
}

impl Stage {
  pub const ALL: [Stage; 2] = [Stage::Roi, Stage::Rcnn];

  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Roi => "roi",
      Stage::Rcnn => "rcnn",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 类别过滤器，`All` 表示不区分类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClassFilter {
  All,
  Car,
  Pedestrian,
  Cyclist,
}

impl ClassFilter {
  pub const ALL: [ClassFilter; 4] = [
    ClassFilter::All,
    ClassFilter::Car,
    ClassFilter::Pedestrian,
    ClassFilter::Cyclist,
  ];

  /// 计数器名称中的类别后缀，例如 `_car`
  pub fn suffix(&self) -> &'static str {
    match self {
      ClassFilter::All => "",
      ClassFilter::Car => "_car",
      ClassFilter::Pedestrian => "_ped",
      ClassFilter::Cyclist => "_cyc",
    }
  }

  pub fn display_name(&self) -> &'static str {
    match self {
      ClassFilter::All => "All",
      ClassFilter::Car => "Car",
      ClassFilter::Pedestrian => "Ped",
      ClassFilter::Cyclist => "Cyc",
    }
  }
}

/// 召回阈值，按数值全序比较
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Threshold(f64);

impl Threshold {
  /// 阈值必须是 (0, 1] 内的有限数
  pub fn new(value: f64) -> Option<Self> {
    (value.is_finite() && value > 0.0 && value <= 1.0).then_some(Threshold(value))
  }

  pub fn value(&self) -> f64 {
    self.0
  }
}

impl PartialEq for Threshold {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for Threshold {}

impl PartialOrd for Threshold {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Threshold {
  fn cmp(&self, other: &Self) -> Ordering {
    self.0.total_cmp(&other.0)
  }
}

impl Hash for Threshold {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.0.to_bits().hash(state);
  }
}

impl fmt::Display for Threshold {
  /// 整数值保留一位小数，例如 `1.0`，与模型侧的键一致
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.0.fract() == 0.0 {
      write!(f, "{:.1}", self.0)
    } else {
      write!(f, "{}", self.0)
    }
  }
}

/// 结构化的计数器键
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CounterKey {
  /// 某阶段在某阈值下召回的真值数
  Recall {
    stage: Stage,
    threshold: Threshold,
    class: ClassFilter,
  },
  /// 真值总数
  GroundTruth(ClassFilter),
}

impl CounterKey {
  /// 模型批次统计中使用的键，例如 `roi_0.3_car`、`gt_ped`
  pub fn batch_suffix(&self) -> String {
    match self {
      CounterKey::Recall {
        stage,
        threshold,
        class,
      } => format!("{}_{}{}", stage, threshold, class.suffix()),
      CounterKey::GroundTruth(class) => format!("gt{}", class.suffix()),
    }
  }

  /// 汇总计数器名称，例如 `recall_roi_0.3_car`、`gt_ped_num`
  pub fn counter_name(&self) -> String {
    match self {
      CounterKey::Recall { .. } => format!("recall_{}", self.batch_suffix()),
      CounterKey::GroundTruth(_) => format!("{}_num", self.batch_suffix()),
    }
  }
}

impl fmt::Display for CounterKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.counter_name())
  }
}

/// 单个批次的统计结果，键为计数器后缀
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchRecord {
  counts: HashMap<String, u64>,
}

impl BatchRecord {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, suffix: impl Into<String>, count: u64) -> Self {
    self.counts.insert(suffix.into(), count);
    self
  }

  pub fn insert(&mut self, suffix: impl Into<String>, count: u64) {
    self.counts.insert(suffix.into(), count);
  }

  /// 缺失的键视为 0
  pub fn get(&self, suffix: &str) -> u64 {
    self.counts.get(suffix).copied().unwrap_or(0)
  }

  /// 逐字段相加
  pub fn combine(mut self, other: &BatchRecord) -> Self {
    for (suffix, count) in &other.counts {
      *self.counts.entry(suffix.clone()).or_insert(0) += count;
    }
    self
  }
}

impl<K: Into<String>> FromIterator<(K, u64)> for BatchRecord {
  fn from_iter<T: IntoIterator<Item = (K, u64)>>(iter: T) -> Self {
    Self {
      counts: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
    }
  }
}

/// 一组形状固定的计数器
///
/// 创建时即包含阈值列表与阶段、类别组合出的全部键，所有计数从 0 开始，
/// 累加过程中只增不减。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSet {
  thresholds: Vec<Threshold>,
  #[serde(with = "counter_entries")]
  counts: BTreeMap<CounterKey, u64>,
}

impl CounterSet {
  pub fn new(thresholds: &[Threshold]) -> Self {
    let mut counts = BTreeMap::new();
    for &threshold in thresholds {
      for stage in Stage::ALL {
        for class in ClassFilter::ALL {
          counts.insert(
            CounterKey::Recall {
              stage,
              threshold,
              class,
            },
            0,
          );
        }
      }
    }
    for class in ClassFilter::ALL {
      counts.insert(CounterKey::GroundTruth(class), 0);
    }

    Self {
      thresholds: thresholds.to_vec(),
      counts,
    }
  }

  pub fn thresholds(&self) -> &[Threshold] {
    &self.thresholds
  }

  pub fn get(&self, key: &CounterKey) -> u64 {
    self.counts.get(key).copied().unwrap_or(0)
  }

  pub fn recall(&self, stage: Stage, threshold: Threshold, class: ClassFilter) -> u64 {
    self.get(&CounterKey::Recall {
      stage,
      threshold,
      class,
    })
  }

  pub fn ground_truth(&self, class: ClassFilter) -> u64 {
    self.get(&CounterKey::GroundTruth(class))
  }

  pub fn iter(&self) -> impl Iterator<Item = (&CounterKey, &u64)> {
    self.counts.iter()
  }

  /// 将一个批次的统计累加进来，未知键忽略，缺失键按 0 处理
  pub fn accumulate(&mut self, record: &BatchRecord) {
    for (key, count) in self.counts.iter_mut() {
      *count += record.get(&key.batch_suffix());
    }
  }

  /// 将另一组计数器逐键相加，两者的阈值列表必须一致
  pub fn merge_from(&mut self, other: &CounterSet) -> Result<(), MetricError> {
    if self.thresholds != other.thresholds {
      return Err(MetricError::ShapeMismatch);
    }
    for (key, count) in self.counts.iter_mut() {
      *count += other.get(key);
    }
    Ok(())
  }

  /// 进度提示：最小阈值下的 `(roi, rcnn) / gt`
  pub fn progress_summary(&self) -> Option<(String, String)> {
    let threshold = *self.thresholds.first()?;
    Some((
      format!("recall_{}", threshold),
      format!(
        "({}, {}) / {}",
        self.recall(Stage::Roi, threshold, ClassFilter::All),
        self.recall(Stage::Rcnn, threshold, ClassFilter::All),
        self.ground_truth(ClassFilter::All)
      ),
    ))
  }
}

// JSON 对象的键只能是字符串，这里按列表序列化
mod counter_entries {
  use std::collections::BTreeMap;

  use serde::{Deserialize, Deserializer, Serialize, Serializer};

  use super::CounterKey;

  pub fn serialize<S: Serializer>(
    counts: &BTreeMap<CounterKey, u64>,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    let entries: Vec<(&CounterKey, &u64)> = counts.iter().collect();
    entries.serialize(serializer)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<BTreeMap<CounterKey, u64>, D::Error> {
    let entries: Vec<(CounterKey, u64)> = Vec::deserialize(deserializer)?;
    Ok(entries.into_iter().collect())
  }
}
