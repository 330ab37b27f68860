// 该文件是 Nanfeng （南风） 项目的一部分。
// src/bin/nanfeng_eval.rs - 回放评估程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use tracing::info;
use url::Url;

use nanfeng::{
  FromUrl,
  config::EvalConfig,
  dist::{Collective, CollectiveWrapper, LocalGroup},
  input::{InputWrapper, ReplayModel},
  output::{JsonResultOutput, OutputWrapper},
  task::{EvalTask, ResultTable},
};

/// Nanfeng 回放评估参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 回放输入，例如 replay:///data/samples.jsonl?batch_size=4
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 评估配置，例如 eval://kitti?thresholds=0.3,0.5,0.7&range=1
  #[arg(long, value_name = "CONFIG", default_value = "eval://kitti")]
  pub config: Url,
  /// 标注结果输出，默认写入结果目录
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
  /// 多进程合并方式，例如 tmpdir:///data/tmpdir?rank=0&world_size=4&run=epoch80
  #[arg(long, value_name = "COLLECTIVE", default_value = "single://")]
  pub collective: Url,
  /// 在本进程内用线程模拟的 worker 数
  #[arg(long, default_value = "1", value_name = "COUNT")]
  pub world_size: usize,
  /// 等待其余 worker 的超时时间（秒）
  #[arg(long, default_value = "1800", value_name = "SECONDS")]
  pub merge_timeout: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("评估配置: {}", args.config);
  info!("合并方式: {}", args.collective);

  let config = EvalConfig::from_url(&args.config)?;
  let input = match InputWrapper::from_url(&args.input)? {
    InputWrapper::Replay(input) => input,
  };
  let output = match &args.output {
    Some(url) => OutputWrapper::from_url(url)?,
    None => OutputWrapper::JsonResultOutput(JsonResultOutput::new(&config.result_dir)),
  };
  let dataset = input.dataset();

  let table = if args.world_size > 1 {
    if args.collective.scheme() != "single" {
      bail!("--world-size 与 --collective 不能同时使用");
    }
    info!("在本进程内模拟 {} 个 worker", args.world_size);
    let group = LocalGroup::new(args.world_size, Duration::from_secs(args.merge_timeout));
    std::thread::scope(|s| -> Result<ResultTable> {
      let handles: Vec<_> = group
        .into_iter()
        .map(|collective| {
          let batches =
            input.batches(collective.world_size(), collective.rank(), config.shard_layout);
          let mut task = EvalTask::new(config.clone());
          let (dataset, output) = (&dataset, &output);
          s.spawn(move || task.run(batches, ReplayModel, dataset, collective, output))
        })
        .collect();

      let mut table = ResultTable::new();
      for (rank, handle) in handles.into_iter().enumerate() {
        let result = handle
          .join()
          .map_err(|_| anyhow!("worker {} 异常退出", rank))??;
        if rank == 0 {
          table = result;
        }
      }
      Ok(table)
    })?
  } else {
    let collective = CollectiveWrapper::from_url(&args.collective)?;
    let batches = input.batches(collective.world_size(), collective.rank(), config.shard_layout);
    let mut task = EvalTask::new(config.clone());
    task.run(batches, ReplayModel, &dataset, collective, &output)?
  };

  if !table.is_empty() {
    println!("{}", serde_json::to_string_pretty(&table)?);
  }

  Ok(())
}
