// 该文件是 Pintu （拼图） 项目的一部分。
// src/bin/run_rle.rs - 把一个运行的概率图编码成提交表
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::{Parser, ValueEnum};
use url::Url;

use pintu::{FromUrl, rle::ScanOrder, store::ProbStore, task::SubmitTask};
use tracing::info;

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
pub enum Order {
  #[default]
  Row,
  Column,
}

impl From<Order> for ScanOrder {
  fn from(order: Order) -> Self {
    match order {
      Order::Row => ScanOrder::RowMajor,
      Order::Column => ScanOrder::ColumnMajor,
    }
  }
}

/// Pintu 提交参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 概率图存储根目录，如 probs:///data/probs
  #[arg(long, value_name = "STORE")]
  pub store: Url,
  /// 运行 ID
  #[arg(long, value_name = "RUN")]
  pub run: String,
  /// 展平掩码的像素顺序
  #[arg(long, value_enum, default_value_t = Order::Row)]
  pub order: Order,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("存储路径: {}", args.store);
  info!("运行 ID: {}", args.run);
  let store = ProbStore::from_url(&args.store)?;

  let path = SubmitTask::default()
    .with_order(args.order.into())
    .run(&store, &args.run)?;

  info!("提交表: {}", path.display());
  Ok(())
}
