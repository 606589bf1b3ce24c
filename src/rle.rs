// 该文件是 Pintu （拼图） 项目的一部分。
// src/rle.rs - 掩码二值化与游程编码
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

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, ArrayView2, ShapeBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 概率阈值，严格大于该值的像素为前景
pub const THRESHOLD: f32 = 0.5;
/// 百分比存储下的阈值
pub const QUANTIZED_THRESHOLD: i8 = 50;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RleError {
  #[error("RLE 编码损坏: {0}")]
  CorruptEncodingError(String),
}

fn corrupt(reason: impl Into<String>) -> RleError {
  RleError::CorruptEncodingError(reason.into())
}

/// 展平掩码时的像素顺序
///
/// 默认按行展平：提交格式中的样例 `[[0,1,1],[0,0,0],[1,0,0]]` 编码为 `2 2 7 1`，
/// 只有按行计位置才得到这一结果（按列展平会得到 `3 2 7 1`）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOrder {
  /// 先从左到右，再从上到下（提交格式默认）
  #[default]
  RowMajor,
  /// 先从上到下，再从左到右
  ColumnMajor,
}

pub fn binarize(probability: ArrayView2<'_, f32>, threshold: f32) -> Array2<u8> {
  probability.mapv(|p| u8::from(p > threshold))
}

pub fn binarize_quantized(map: ArrayView2<'_, i8>) -> Array2<u8> {
  map.mapv(|q| u8::from(q > QUANTIZED_THRESHOLD))
}

/// 前景游程，`(起始位置, 长度)`，起始位置从 1 开始计数
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rle {
  runs: Vec<(usize, usize)>,
}

impl Rle {
  pub fn runs(&self) -> &[(usize, usize)] {
    &self.runs
  }

  pub fn is_empty(&self) -> bool {
    self.runs.is_empty()
  }

  /// 前景像素数
  pub fn area(&self) -> usize {
    self.runs.iter().map(|&(_, length)| length).sum()
  }

  pub fn to_mask(&self, shape: (usize, usize), order: ScanOrder) -> Result<Array2<u8>, RleError> {
    let (height, width) = shape;
    let total = height * width;
    let mut flat = vec![0u8; total];
    for &(start, length) in &self.runs {
      let begin = start - 1;
      let end = begin + length;
      if end > total {
        return Err(corrupt(format!(
          "游程 ({}, {}) 超出 {}x{} 掩码的范围",
          start, length, height, width
        )));
      }
      flat[begin..end].fill(1);
    }

    let mask = match order {
      ScanOrder::RowMajor => Array2::from_shape_vec((height, width), flat),
      ScanOrder::ColumnMajor => Array2::from_shape_vec((height, width).f(), flat),
    };
    mask.map_err(|e| corrupt(e.to_string()))
  }
}

impl fmt::Display for Rle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, (start, length)) in self.runs.iter().enumerate() {
      if i > 0 {
        f.write_str(" ")?;
      }
      write!(f, "{} {}", start, length)?;
    }
    Ok(())
  }
}

impl FromStr for Rle {
  type Err = RleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let numbers = s
      .split_whitespace()
      .map(|token| {
        token
          .parse::<usize>()
          .map_err(|_| corrupt(format!("无法解析的数字 '{}'", token)))
      })
      .collect::<Result<Vec<_>, _>>()?;
    if numbers.len() % 2 != 0 {
      return Err(corrupt(format!("数字个数 {} 不是偶数", numbers.len())));
    }

    let mut runs = Vec::with_capacity(numbers.len() / 2);
    let mut previous_end = 1usize;
    for pair in numbers.chunks_exact(2) {
      let (start, length) = (pair[0], pair[1]);
      if start == 0 {
        return Err(corrupt("起始位置从 1 开始计数"));
      }
      if length == 0 {
        return Err(corrupt(format!("起始于 {} 的游程长度为 0", start)));
      }
      if start < previous_end {
        return Err(corrupt(format!(
          "游程 ({}, {}) 与前一个游程重叠或顺序颠倒",
          start, length
        )));
      }
      previous_end = start
        .checked_add(length)
        .ok_or_else(|| corrupt(format!("游程 ({}, {}) 溢出", start, length)))?;
      runs.push((start, length));
    }
    Ok(Self { runs })
  }
}

pub fn encode(mask: ArrayView2<'_, u8>, order: ScanOrder) -> Rle {
  let total = mask.len();
  let pixels = match order {
    ScanOrder::RowMajor => mask.into_iter(),
    ScanOrder::ColumnMajor => mask.reversed_axes().into_iter(),
  };

  let mut runs = Vec::new();
  let mut run_start = None;
  for (index, &value) in pixels.enumerate() {
    match (value != 0, run_start) {
      (true, None) => run_start = Some(index),
      (false, Some(start)) => {
        runs.push((start + 1, index - start));
        run_start = None;
      }
      _ => {}
    }
  }
  if let Some(start) = run_start {
    runs.push((start + 1, total - start));
  }
  Rle { runs }
}

pub fn decode(encoded: &str, shape: (usize, usize), order: ScanOrder) -> Result<Array2<u8>, RleError> {
  encoded.parse::<Rle>()?.to_mask(shape, order)
}
