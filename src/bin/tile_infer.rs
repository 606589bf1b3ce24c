// 该文件是 Pintu （拼图） 项目的一部分。
// src/bin/tile_infer.rs - 切片推理，每种测试时增强写出一个运行
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::{Result, bail};
use clap::Parser;
use url::Url;

use pintu::{
  FromUrl,
  config::ExperimentConfig,
  input::{ImageDirInput, MaskDir},
  model::ModelRegistry,
  store::ProbStore,
  task::{Task, TileInferenceTask, ValidationTask, install_interrupt_handler},
};
use tracing::info;

/// Pintu 切片推理参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 实验配置文件 (JSON)
  #[arg(long, value_name = "FILE")]
  pub experiment: std::path::PathBuf,
  /// 输入图像目录，如 images:///data/test?ext=jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 概率图存储根目录，如 probs:///data/probs
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// 验证图像目录；与 --masks 一同给出时先评估验证精度，覆盖配置中的值
  #[arg(long, value_name = "SOURCE", requires = "masks")]
  pub validation: Option<Url>,
  /// 验证集真值掩码目录，如 masks:///data/train_masks?ext=gif&suffix=_mask
  #[arg(long, value_name = "MASKS", requires = "validation")]
  pub masks: Option<Url>,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("实验配置: {}", args.experiment.display());
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let experiment = ExperimentConfig::load(&args.experiment)?;
  let model = ModelRegistry::default().build(experiment.model_id(), &experiment.params)?;
  let input = ImageDirInput::from_url(&args.input)?;
  let store = ProbStore::from_url(&args.output)?;

  let accuracy = match (&args.validation, &args.masks) {
    (Some(validation), Some(masks)) => {
      info!("验证集: {}, 真值掩码: {}", validation, masks);
      let validation = ImageDirInput::from_url(validation)?;
      let masks = MaskDir::from_url(masks)?;
      Some(ValidationTask::new(experiment.clone()).run_task(validation, &model, &masks)?)
    }
    (None, None) => experiment.validation_accuracy,
    _ => bail!("--validation 与 --masks 必须同时给出"),
  };
  let Some(accuracy) = accuracy else {
    bail!("实验 {} 没有验证精度, 请给出 --validation 与 --masks", experiment.name);
  };
  info!("验证精度: {:.4}", accuracy);

  let interrupt = install_interrupt_handler()?;
  let runs = TileInferenceTask::new(experiment)
    .with_accuracy(Some(accuracy))
    .with_frame_number(args.frame_number)
    .with_interrupt(interrupt)
    .run_task(input, model, &store)?;

  for run in runs {
    info!("运行已写出: {}", store.run_dir(&run).display());
  }
  Ok(())
}
