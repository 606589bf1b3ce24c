// 该文件是 Pintu （拼图） 项目的一部分。
// src/eval.rs - 验证集上的 Dice 系数
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

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2, Zip};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
  #[error("预测尺寸 {actual:?} 与真值掩码尺寸 {expected:?} 不一致")]
  ShapeMismatch {
    actual: (usize, usize),
    expected: (usize, usize),
  },
  #[error("图像 {0} 没有真值掩码")]
  MissingMaskError(String),
}

/// 按图像键提供真值掩码，取值 0/1
pub trait MaskSource {
  type Error;
  fn mask(&self, key: &str) -> Result<Array2<u8>, Self::Error>;
}

impl MaskSource for HashMap<String, Array2<u8>> {
  type Error = EvalError;

  fn mask(&self, key: &str) -> Result<Array2<u8>, EvalError> {
    self
      .get(key)
      .cloned()
      .ok_or_else(|| EvalError::MissingMaskError(key.to_string()))
  }
}

/// `2|A∩B| / (|A| + |B|)`，非零像素视为前景；两者都为空时记为 1
pub fn dice(prediction: ArrayView2<'_, u8>, target: ArrayView2<'_, u8>) -> Result<f64, EvalError> {
  if prediction.dim() != target.dim() {
    return Err(EvalError::ShapeMismatch {
      actual: prediction.dim(),
      expected: target.dim(),
    });
  }

  let (mut both, mut total) = (0usize, 0usize);
  Zip::from(&prediction).and(&target).for_each(|&p, &t| {
    let (p, t) = (p != 0, t != 0);
    both += usize::from(p && t);
    total += usize::from(p) + usize::from(t);
  });

  if total == 0 {
    return Ok(1.0);
  }
  Ok(2.0 * both as f64 / total as f64)
}

/// 逐图 Dice 的算术平均
#[derive(Debug, Clone, Default)]
pub struct MeanDice {
  sum: f64,
  count: usize,
}

impl MeanDice {
  pub fn push(&mut self, score: f64) {
    self.sum += score;
    self.count += 1;
  }

  pub fn count(&self) -> usize {
    self.count
  }

  pub fn mean(&self) -> Option<f64> {
    (self.count > 0).then(|| self.sum / self.count as f64)
  }
}
