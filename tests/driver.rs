use std::{cell::Cell, convert::Infallible, path::Path, time::Duration};

use nanfeng::{
  annotation::AnnotationRecord,
  config::{ConfigError, EvalConfig},
  dataset::{Dataset, EvaluationResult},
  dist::{FileGroup, LocalGroup, SingleProcess},
  input::{ReplayInput, ReplayModel, ReplaySample},
  metric::BatchRecord,
  model::{Model, ModelOutput},
  output::JsonResultOutput,
  sampler::ShardLayout,
  task::{EvalError, EvalState, EvalTask, ResultTable, SMOKE_TEST_BATCHES},
};

fn sample(index: usize, variants: usize) -> ReplaySample {
  ReplaySample {
    records: vec![
      BatchRecord::new()
        .with("gt", 2)
        .with("roi_0.5", 1)
        .with("rcnn_0.5", 2),
    ],
    predictions: (0..variants)
      .map(|v| {
        AnnotationRecord::new(["Car"])
          .with_field("frame_id", format!("{:06}", index))
          .with_field("variant", v as u64)
      })
      .collect(),
  }
}

fn replay_input(total: usize, variants: usize, batch_size: usize) -> ReplayInput {
  ReplayInput::new(
    (0..total).map(|i| sample(i, variants)).collect(),
    vec!["Car".to_string(), "Pedestrian".to_string()],
    batch_size,
  )
}

fn config(dir: &Path) -> EvalConfig {
  EvalConfig::new(&[0.5]).unwrap().with_result_dir(dir)
}

fn run_local(
  input: &ReplayInput,
  config: &EvalConfig,
  world_size: usize,
) -> Vec<Result<ResultTable, EvalError>> {
  let dataset = input.dataset();
  let output = JsonResultOutput::new(&config.result_dir);
  let group = LocalGroup::new(world_size, Duration::from_secs(10));
  std::thread::scope(|s| {
    let handles: Vec<_> = group
      .into_iter()
      .enumerate()
      .map(|(rank, collective)| {
        let batches = input.batches(world_size, rank, config.shard_layout);
        let mut task = EvalTask::new(config.clone());
        let (dataset, output) = (&dataset, &output);
        s.spawn(move || {
          let result = task.run(batches, ReplayModel, dataset, collective, output);
          if result.is_ok() {
            assert_eq!(task.state(), EvalState::Done);
          }
          result
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  })
}

fn frame_ids(path: &Path) -> Vec<String> {
  let data = std::fs::read(path).unwrap();
  let annos: Vec<AnnotationRecord> = serde_json::from_slice(&data).unwrap();
  annos
    .iter()
    .map(|a| a.frame_id().unwrap().to_string())
    .collect()
}

#[test]
fn three_local_workers() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path());
  let input = replay_input(10, 1, 2);

  let results = run_local(&input, &config, 3);
  let tables: Vec<ResultTable> = results.into_iter().map(Result::unwrap).collect();

  // 12 个填充后的样本，每个 gt=2
  let coordinator = &tables[0];
  assert!((coordinator["recall/roi_0.5"] - 0.5).abs() < 1e-12);
  assert!((coordinator["recall/rcnn_0.5"] - 1.0).abs() < 1e-12);
  assert_eq!(coordinator["count/Car"], 10.0);
  assert_eq!(coordinator["count/Pedestrian"], 0.0);
  assert!(tables[1].is_empty());
  assert!(tables[2].is_empty());

  let expected: Vec<String> = (0..10).map(|i| format!("{:06}", i)).collect();
  assert_eq!(frame_ids(&tmp.path().join("result.json")), expected);
}

#[test]
fn contiguous_layout_restores_order() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path()).with_shard_layout(ShardLayout::Contiguous);
  let input = replay_input(7, 1, 3);

  let results = run_local(&input, &config, 4);
  assert!(results.iter().all(Result::is_ok));

  let expected: Vec<String> = (0..7).map(|i| format!("{:06}", i)).collect();
  assert_eq!(frame_ids(&tmp.path().join("result.json")), expected);
}

#[test]
fn variants_are_reported_separately() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path());
  let input = replay_input(4, 2, 1);

  let table = run_local(&input, &config, 2).remove(0).unwrap();
  assert_eq!(table["count/Car"], 4.0);
  assert_eq!(table["variant_1/count/Car"], 4.0);
  assert!(tmp.path().join("result.json").exists());
  assert_eq!(frame_ids(&tmp.path().join("result_variant_1.json")).len(), 4);
}

#[test]
fn more_workers_than_samples() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path());
  // 2 个样本分给 3 个 worker，填充后每个 worker 各 1 个
  let input = replay_input(2, 1, 1);

  let results = run_local(&input, &config, 3);
  let table = results.into_iter().next().unwrap().unwrap();
  assert!((table["recall/rcnn_0.5"] - 1.0).abs() < 1e-12);
  assert_eq!(frame_ids(&tmp.path().join("result.json")), ["000000", "000001"]);
}

#[test]
fn workers_without_samples() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path());
  let input = replay_input(0, 1, 1);

  let results = run_local(&input, &config, 2);
  let table = results.into_iter().next().unwrap().unwrap();
  assert_eq!(table["recall/roi_0.5"], 0.0);
  assert_eq!(table["recall/rcnn_0.5"], 0.0);
  // 空数据集仍然会调用评估
  assert_eq!(table["count/Car"], 0.0);
  assert_eq!(table["count/Pedestrian"], 0.0);
  assert!(frame_ids(&tmp.path().join("result.json")).is_empty());
}

#[test]
fn range_mode_adds_band_keys() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path()).with_eval_by_range(true);
  let near = BatchRecord::new().with("gt", 1).with("roi_0.5", 1);
  let far = BatchRecord::new().with("gt", 3).with("roi_0.5", 1);
  let all = near.clone().combine(&far);
  let input = ReplayInput::new(
    vec![ReplaySample {
      records: vec![all, near, BatchRecord::new(), far],
      predictions: vec![AnnotationRecord::new(["Car"])],
    }],
    vec!["Car".to_string()],
    1,
  );

  let mut task = EvalTask::new(config.clone());
  let table = task
    .run(
      input.batches(1, 0, ShardLayout::Strided),
      ReplayModel,
      input.dataset(),
      SingleProcess,
      JsonResultOutput::new(&config.result_dir),
    )
    .unwrap();
  assert!((table["recall/roi_0.5"] - 0.5).abs() < 1e-12);
  assert!((table["recall/near/roi_0.5"] - 1.0).abs() < 1e-12);
  assert_eq!(table["recall/mid/roi_0.5"], 0.0);
  assert!((table["recall/far/roi_0.5"] - 1.0 / 3.0).abs() < 1e-12);
}

#[test]
fn smoke_test_stops_early() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path()).with_smoke_test(true);
  let input = replay_input(SMOKE_TEST_BATCHES + 5, 1, 1);

  let mut task = EvalTask::new(config.clone());
  let table = task
    .run(
      input.batches(1, 0, ShardLayout::Strided),
      ReplayModel,
      input.dataset(),
      SingleProcess,
      JsonResultOutput::new(&config.result_dir),
    )
    .unwrap();
  assert_eq!(table["count/Car"], SMOKE_TEST_BATCHES as f64);
  assert_eq!(
    frame_ids(&tmp.path().join("result.json")).len(),
    SMOKE_TEST_BATCHES
  );
}

#[test]
fn file_group_workers() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(&tmp.path().join("result"));
  let exchange = tmp.path().join("exchange");
  let input = replay_input(5, 1, 2);
  let dataset = input.dataset();
  let output = JsonResultOutput::new(&config.result_dir);

  let tables: Vec<ResultTable> = std::thread::scope(|s| {
    let handles: Vec<_> = (0..2)
      .map(|rank| {
        let collective = FileGroup::new(&exchange, rank, 2, Duration::from_secs(10)).unwrap();
        let batches = input.batches(2, rank, ShardLayout::Strided);
        let mut task = EvalTask::new(config.clone());
        let (dataset, output) = (&dataset, &output);
        s.spawn(move || {
          task
            .run(batches, ReplayModel, dataset, collective, output)
            .unwrap()
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  assert_eq!(tables[0]["count/Car"], 5.0);
  assert!(tables[1].is_empty());
  assert!(!exchange.exists());
  assert_eq!(frame_ids(&config.result_dir.join("result.json")).len(), 5);
}

#[test]
fn saved_records_are_written() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path()).with_save_to_file(true);
  let input = replay_input(3, 1, 2);

  let mut task = EvalTask::new(config.clone());
  task
    .run(
      input.batches(1, 0, ShardLayout::Strided),
      ReplayModel,
      input.dataset(),
      SingleProcess,
      JsonResultOutput::new(&config.result_dir),
    )
    .unwrap();

  let record = std::fs::read_to_string(config.final_output_dir().join("000001.txt")).unwrap();
  assert!(record.starts_with("Car"));
}

struct CountingModel<'a> {
  calls: &'a Cell<usize>,
}

impl Model for CountingModel<'_> {
  type Input = usize;
  type Predictions = Vec<AnnotationRecord>;
  type Error = Infallible;

  fn infer(&self, _input: &usize) -> Result<ModelOutput<Self::Predictions>, Self::Error> {
    self.calls.set(self.calls.get() + 1);
    Ok(ModelOutput {
      predictions: vec![vec![AnnotationRecord::default()]],
      records: vec![BatchRecord::new()],
    })
  }
}

struct EmptyDataset;

impl Dataset for EmptyDataset {
  type Batch = usize;
  type Predictions = Vec<AnnotationRecord>;
  type Error = Infallible;

  fn class_names(&self) -> &[String] {
    &[]
  }

  fn len(&self) -> usize {
    3
  }

  fn generate_prediction_dicts(
    &self,
    _batch: &usize,
    predictions: &Vec<AnnotationRecord>,
    _class_names: &[String],
    _output_path: Option<&Path>,
  ) -> Result<Vec<AnnotationRecord>, Self::Error> {
    Ok(predictions.clone())
  }

  fn evaluation(
    &self,
    _annotations: &[AnnotationRecord],
    _class_names: &[String],
    _eval_metric: &str,
    _output_path: &Path,
  ) -> Result<EvaluationResult, Self::Error> {
    Ok((String::new(), Default::default()))
  }
}

#[test]
fn invalid_config_runs_no_batch() {
  let tmp = tempfile::tempdir().unwrap();
  let mut config = config(tmp.path());
  config.recall_thresholds.clear();
  let calls = Cell::new(0);

  let mut task = EvalTask::new(config.clone());
  let result = task.run(
    0..3usize,
    CountingModel { calls: &calls },
    EmptyDataset,
    SingleProcess,
    JsonResultOutput::new(&config.result_dir),
  );
  assert!(matches!(
    result,
    Err(EvalError::ConfigError(ConfigError::MissingThresholds))
  ));
  assert_eq!(calls.get(), 0);
  assert_eq!(task.state(), EvalState::Idle);
}

#[test]
fn task_runs_only_once() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path());
  let calls = Cell::new(0);

  let mut task = EvalTask::new(config.clone());
  let table = task
    .run(
      0..3usize,
      CountingModel { calls: &calls },
      EmptyDataset,
      SingleProcess,
      JsonResultOutput::new(&config.result_dir),
    )
    .unwrap();
  assert_eq!(calls.get(), 3);
  assert_eq!(table["recall/roi_0.5"], 0.0);
  assert_eq!(task.state(), EvalState::Done);

  let again = task.run(
    0..3usize,
    CountingModel { calls: &calls },
    EmptyDataset,
    SingleProcess,
    JsonResultOutput::new(&config.result_dir),
  );
  assert!(matches!(
    again,
    Err(EvalError::AlreadyStarted(EvalState::Done))
  ));
}

#[test]
fn stalled_worker_times_out() {
  let tmp = tempfile::tempdir().unwrap();
  let config = config(tmp.path());
  let input = replay_input(4, 1, 1);
  let mut group = LocalGroup::new(2, Duration::from_millis(100));
  let _silent = group.pop().unwrap();
  let coordinator = group.pop().unwrap();

  let mut task = EvalTask::new(config.clone());
  let result = task.run(
    input.batches(2, 0, ShardLayout::Strided),
    ReplayModel,
    input.dataset(),
    coordinator,
    JsonResultOutput::new(&config.result_dir),
  );
  assert!(matches!(result, Err(EvalError::MergeError(_))));
  assert_eq!(task.state(), EvalState::Merging);
}
