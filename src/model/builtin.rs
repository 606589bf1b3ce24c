// 该文件是 Pintu （拼图） 项目的一部分。
// src/model/builtin.rs - 内置的轻量模型
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

use ndarray::{Array2, Axis};

use super::{BoxedModel, Model, ModelError, ModelParams, Tile};

fn check_tile(tile: &Tile) -> Result<(), ModelError> {
  let (channels, height, width) = tile.dim();
  if channels == 0 || height == 0 || width == 0 {
    return Err(ModelError::ShapeError(format!(
      "切片形状 {:?} 不能有空维度",
      tile.dim()
    )));
  }
  Ok(())
}

/// 对每个像素输出同一个概率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constant {
  probability: f32,
}

impl Constant {
  pub const ID: &'static str = "Constant";

  pub fn new(probability: f32) -> Result<Self, ModelError> {
    if !(0.0..=1.0).contains(&probability) {
      return Err(ModelError::ParamError(format!(
        "概率必须在 [0, 1] 内, 实际为 {}",
        probability
      )));
    }
    Ok(Self { probability })
  }

  pub fn build(params: &ModelParams) -> Result<BoxedModel, ModelError> {
    Ok(Box::new(Self::new(params.get_or("probability", 0.5)?)?))
  }
}

impl Model for Constant {
  type Input = Tile;
  type Output = Array2<f32>;
  type Error = ModelError;

  fn infer(&self, input: &Tile) -> Result<Array2<f32>, ModelError> {
    check_tile(input)?;
    let (_, height, width) = input.dim();
    Ok(Array2::from_elem((height, width), self.probability))
  }
}

/// `sigmoid(gain * (mean_c(x) - offset))`，逐像素按通道均值计算
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Brightness {
  gain: f32,
  offset: f32,
}

impl Brightness {
  pub const ID: &'static str = "Brightness";

  pub fn new(gain: f32, offset: f32) -> Self {
    Self { gain, offset }
  }

  pub fn build(params: &ModelParams) -> Result<BoxedModel, ModelError> {
    Ok(Box::new(Self::new(
      params.get_or("gain", 12.0)?,
      params.get_or("offset", 0.5)?,
    )))
  }
}

impl Model for Brightness {
  type Input = Tile;
  type Output = Array2<f32>;
  type Error = ModelError;

  fn infer(&self, input: &Tile) -> Result<Array2<f32>, ModelError> {
    check_tile(input)?;
    let mean = input
      .mean_axis(Axis(0))
      .ok_or_else(|| ModelError::ShapeError("切片没有通道".to_string()))?;
    Ok(mean.mapv(|m| 1.0 / (1.0 + (-self.gain * (m - self.offset)).exp())))
  }
}
