// 该文件是 Pintu （拼图） 项目的一部分。
// src/model.rs - 切片推理模型接口
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

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 模型输入：一个 (C, H, W) 切片
pub type Tile = Array3<f32>;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

impl<M: Model + ?Sized> Model for Box<M> {
  type Input = M::Input;
  type Output = M::Output;
  type Error = M::Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    (**self).infer(input)
  }
}

impl<M: Model + ?Sized> Model for &M {
  type Input = M::Input;
  type Output = M::Output;
  type Error = M::Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    (**self).infer(input)
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
  #[error("未知模型: {0}")]
  UnknownModelError(String),
  #[error("模型参数错误: {0}")]
  ParamError(String),
  #[error("模型输入形状错误: {0}")]
  ShapeError(String),
}

/// 注册表中的模型统一为切片到概率图的映射
pub type TileModel = dyn Model<Input = Tile, Output = Array2<f32>, Error = ModelError> + Send + Sync;
pub type BoxedModel = Box<TileModel>;

/// 模型构造参数，按名称取值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelParams(BTreeMap<String, f32>);

impl ModelParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: &str, value: f32) -> Self {
    self.0.insert(name.to_string(), value);
    self
  }

  pub fn get(&self, name: &str) -> Option<f32> {
    self.0.get(name).copied()
  }

  pub fn get_or(&self, name: &str, default: f32) -> Result<f32, ModelError> {
    match self.get(name) {
      Some(value) if !value.is_finite() => Err(ModelError::ParamError(format!(
        "参数 {} 必须为有限数, 实际为 {}",
        name, value
      ))),
      Some(value) => Ok(value),
      None => Ok(default),
    }
  }
}

mod builtin;
mod registry;

pub use self::builtin::{Brightness, Constant};
pub use self::registry::{ModelConstructor, ModelRegistry};
