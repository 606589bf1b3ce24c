// 该文件是 Pintu （拼图） 项目的一部分。
// src/model/registry.rs - 模型标识到构造函数的注册表
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

use tracing::{error, info, warn};

use super::{BoxedModel, Brightness, Constant, ModelError, ModelParams};

pub type ModelConstructor = fn(&ModelParams) -> Result<BoxedModel, ModelError>;

/// 实验名形如 `<模型>_<描述>`，前缀即模型标识
#[derive(Debug, Clone)]
pub struct ModelRegistry {
  constructors: BTreeMap<String, ModelConstructor>,
}

impl Default for ModelRegistry {
  fn default() -> Self {
    let mut registry = Self::empty();
    registry.register(Constant::ID, Constant::build);
    registry.register(Brightness::ID, Brightness::build);
    registry
  }
}

impl ModelRegistry {
  pub fn empty() -> Self {
    Self {
      constructors: BTreeMap::new(),
    }
  }

  /// 注册构造函数，返回被替换掉的旧构造函数
  pub fn register(&mut self, id: &str, constructor: ModelConstructor) -> Option<ModelConstructor> {
    let previous = self.constructors.insert(id.to_string(), constructor);
    if previous.is_some() {
      warn!("模型 {} 已注册, 旧的构造函数被替换", id);
    }
    previous
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.constructors.keys().map(String::as_str)
  }

  pub fn build(&self, id: &str, params: &ModelParams) -> Result<BoxedModel, ModelError> {
    let constructor = self.constructors.get(id).ok_or_else(|| {
      error!("未知模型 {}, 可用模型: {:?}", id, self.ids().collect::<Vec<_>>());
      ModelError::UnknownModelError(id.to_string())
    })?;
    let model = constructor(params)?;
    info!("构建模型 {}", id);
    Ok(model)
  }

  pub fn build_for_experiment(
    &self,
    experiment: &str,
    params: &ModelParams,
  ) -> Result<BoxedModel, ModelError> {
    let id = experiment.split('_').next().unwrap_or(experiment);
    self.build(id, params)
  }
}
