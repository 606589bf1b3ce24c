// 该文件是 Pintu （拼图） 项目的一部分。
// src/bin/ensemble.rs - 按验证精度加权集成多个运行
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use url::Url;

use pintu::{FromUrl, store::ProbStore, task::EnsembleTask};
use tracing::info;

/// Pintu 集成参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 概率图存储根目录，如 probs:///data/probs
  #[arg(long, value_name = "STORE")]
  pub store: Url,
  /// 参与集成的运行 ID
  #[arg(long = "run", value_name = "RUN", required = true)]
  pub runs: Vec<String>,
  /// 显式权重，顺序与运行一致；缺省时由清单中的验证精度导出
  #[arg(long = "weight", value_name = "WEIGHT")]
  pub weights: Vec<f64>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("存储路径: {}", args.store);
  let store = ProbStore::from_url(&args.store)?;
  let weights = (!args.weights.is_empty()).then_some(args.weights);

  let run = EnsembleTask::default()
    .with_weights(weights)
    .run(&store, args.runs)?;

  info!("集成结果: {}", store.run_dir(&run).display());
  Ok(())
}
