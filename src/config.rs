// 该文件是 Pintu （拼图） 项目的一部分。
// src/config.rs - 实验配置
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

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::augment::{AugmentError, Augmentation, AugmentationRegistry};
use crate::model::ModelParams;
use crate::tile::{TileConfig, TileError};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] io::Error),
  #[error("配置解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("切片配置错误: {0}")]
  TileError(#[from] TileError),
  #[error("增强配置错误: {0}")]
  AugmentError(#[from] AugmentError),
  #[error("配置无效: {0}")]
  InvalidError(String),
}

fn default_test_time_aug() -> Vec<String> {
  vec![Augmentation::Identity.name()]
}

fn default_batch_size() -> usize {
  1
}

fn default_channels() -> usize {
  3
}

/// 一个实验：模型、切片方式、测试时增强与记录的验证精度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
  /// 实验名，形如 `<模型>_<描述>`
  pub name: String,
  /// 显式模型标识，缺省时取实验名前缀
  #[serde(default)]
  pub model: Option<String>,
  #[serde(default)]
  pub params: ModelParams,
  pub tile: TileConfig,
  #[serde(default = "default_test_time_aug")]
  pub test_time_aug: Vec<String>,
  /// 每批并行推理的切片数
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
  /// 已知的验证精度；缺省时须在推理前于验证集上评估
  #[serde(default)]
  pub validation_accuracy: Option<f64>,
  #[serde(default = "default_channels")]
  pub channels: usize,
}

impl ExperimentConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let file = File::open(path)?;
    let config: Self = serde_json::from_reader(BufReader::new(file))?;
    config.validate().inspect_err(|e| {
      error!("实验配置 {} 无效: {}", path.display(), e);
    })?;
    info!("加载实验配置 {}: {}", path.display(), config.name);
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.name.is_empty() {
      return Err(ConfigError::InvalidError("实验名不能为空".to_string()));
    }
    if self.batch_size == 0 {
      return Err(ConfigError::InvalidError("batch_size 必须大于 0".to_string()));
    }
    if self.channels == 0 {
      return Err(ConfigError::InvalidError("channels 必须大于 0".to_string()));
    }
    if let Some(accuracy) = self
      .validation_accuracy
      .filter(|a| !a.is_finite() || !(0.0..=1.0).contains(a))
    {
      return Err(ConfigError::InvalidError(format!(
        "validation_accuracy 必须在 [0, 1] 内, 实际为 {}",
        accuracy
      )));
    }
    self.tile.validate()?;

    let augmentations = self.augmentations()?;
    if augmentations.is_empty() {
      return Err(ConfigError::InvalidError("至少需要一种测试时增强".to_string()));
    }
    let (tile_h, tile_w) = self.tile.tile_size();
    if tile_h != tile_w && augmentations.contains(&Augmentation::Transpose) {
      return Err(ConfigError::InvalidError(format!(
        "转置增强要求正方形切片, 实际为 {}x{}",
        tile_h, tile_w
      )));
    }
    Ok(())
  }

  pub fn augmentations(&self) -> Result<Vec<Augmentation>, ConfigError> {
    Ok(AugmentationRegistry::default().resolve(&self.test_time_aug)?)
  }

  /// 注册表中的模型标识
  pub fn model_id(&self) -> &str {
    match &self.model {
      Some(model) => model,
      None => self.name.split('_').next().unwrap_or(&self.name),
    }
  }
}
