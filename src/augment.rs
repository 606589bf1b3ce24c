// 该文件是 Pintu （拼图） 项目的一部分。
// src/augment.rs - 测试时增强（TTA）及其逆变换
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

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AugmentError {
  #[error("形状错误: {0}")]
  ShapeError(String),
  #[error("未知的增强方式: {0}")]
  UnknownAugmentation(String),
  #[error("增强方式重复: {0}")]
  DuplicateAugmentation(String),
}

/// 测试时增强
///
/// 所有变换都只作用于最后两个（空间）轴，并且逆变换是精确的：
/// `inverse(forward(x)) == x` 逐位成立。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Augmentation {
  Identity,
  HorizontalFlip,
  VerticalFlip,
  Rotate180,
  /// 交换行列，仅适用于正方形切片
  Transpose,
  /// 循环平移整数像素
  Shift { dy: isize, dx: isize },
}

impl Augmentation {
  pub fn name(&self) -> String {
    match self {
      Augmentation::Identity => "none".to_string(),
      Augmentation::HorizontalFlip => "hflip".to_string(),
      Augmentation::VerticalFlip => "vflip".to_string(),
      Augmentation::Rotate180 => "rot180".to_string(),
      Augmentation::Transpose => "transpose".to_string(),
      Augmentation::Shift { dy, dx } => format!("shift:{}:{}", dy, dx),
    }
  }

  /// 作用于送入模型前的切片像素 (C, H, W)
  pub fn forward(&self, tile: ArrayView3<'_, f32>) -> Result<Array3<f32>, AugmentError> {
    match *self {
      Augmentation::Shift { dy, dx } => Ok(roll(tile, dy, dx, false)),
      _ => self.self_inverse(tile),
    }
  }

  /// 作用于模型输出 (C, H, W)，恢复原始像素对齐
  pub fn inverse(&self, prediction: ArrayView3<'_, f32>) -> Result<Array3<f32>, AugmentError> {
    match *self {
      Augmentation::Shift { dy, dx } => Ok(roll(prediction, dy, dx, true)),
      _ => self.self_inverse(prediction),
    }
  }

  pub fn inverse_2d(&self, prediction: ArrayView2<'_, f32>) -> Result<Array2<f32>, AugmentError> {
    let restored = self.inverse(prediction.insert_axis(Axis(0)))?;
    Ok(restored.index_axis_move(Axis(0), 0))
  }

  // 翻转、旋转 180 度与转置都是自身的逆
  fn self_inverse(&self, array: ArrayView3<'_, f32>) -> Result<Array3<f32>, AugmentError> {
    let flipped = match self {
      Augmentation::Identity => array.to_owned(),
      Augmentation::HorizontalFlip => array.slice(s![.., .., ..;-1]).to_owned(),
      Augmentation::VerticalFlip => array.slice(s![.., ..;-1, ..]).to_owned(),
      Augmentation::Rotate180 => array.slice(s![.., ..;-1, ..;-1]).to_owned(),
      Augmentation::Transpose => {
        let (_, height, width) = array.dim();
        if height != width {
          return Err(AugmentError::ShapeError(format!(
            "转置只适用于正方形切片, 实际为 {}x{}",
            height, width
          )));
        }
        array
          .permuted_axes([0, 2, 1])
          .as_standard_layout()
          .into_owned()
      }
      Augmentation::Shift { dy, dx } => roll(array, *dy, *dx, false),
    };
    Ok(flipped)
  }
}

impl fmt::Display for Augmentation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name())
  }
}

impl FromStr for Augmentation {
  type Err = AugmentError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "none" => Ok(Augmentation::Identity),
      "hflip" => Ok(Augmentation::HorizontalFlip),
      "vflip" => Ok(Augmentation::VerticalFlip),
      "rot180" => Ok(Augmentation::Rotate180),
      "transpose" => Ok(Augmentation::Transpose),
      _ => {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
          (Some("shift"), Some(dy), Some(dx), None) => {
            let dy = dy
              .parse()
              .map_err(|_| AugmentError::UnknownAugmentation(s.to_string()))?;
            let dx = dx
              .parse()
              .map_err(|_| AugmentError::UnknownAugmentation(s.to_string()))?;
            Ok(Augmentation::Shift { dy, dx })
          }
          _ => Err(AugmentError::UnknownAugmentation(s.to_string())),
        }
      }
    }
  }
}

/// 循环平移：`out[y][x] = in[y - dy][x - dx]`，`undo` 时反向平移
///
/// 位移先按轴长取模，任意 `isize` 位移都不会溢出。
fn roll(array: ArrayView3<'_, f32>, dy: isize, dx: isize, undo: bool) -> Array3<f32> {
  let (channels, height, width) = array.dim();
  if height == 0 || width == 0 {
    return array.to_owned();
  }
  let offset = |d: isize, n: usize| {
    let d = d.rem_euclid(n as isize) as usize;
    if undo { (n - d) % n } else { d }
  };
  let (oy, ox) = (offset(dy, height), offset(dx, width));
  Array3::from_shape_fn((channels, height, width), |(c, y, x)| {
    array[[c, (y + height - oy) % height, (x + width - ox) % width]]
  })
}

/// 可用增强方式的有序目录
#[derive(Debug, Clone)]
pub struct AugmentationRegistry {
  entries: Vec<Augmentation>,
}

impl Default for AugmentationRegistry {
  fn default() -> Self {
    Self {
      entries: vec![
        Augmentation::Identity,
        Augmentation::HorizontalFlip,
        Augmentation::VerticalFlip,
        Augmentation::Rotate180,
        Augmentation::Transpose,
      ],
    }
  }
}

impl AugmentationRegistry {
  pub fn entries(&self) -> &[Augmentation] {
    &self.entries
  }

  /// 按实验配置中的顺序解析增强方式；平移属于参数化增强，总是可用
  pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Augmentation>, AugmentError> {
    let mut resolved: Vec<Augmentation> = Vec::with_capacity(names.len());
    for name in names {
      let name = name.as_ref();
      let augmentation: Augmentation = name.parse()?;
      let known = matches!(augmentation, Augmentation::Shift { .. })
        || self.entries.contains(&augmentation);
      if !known {
        return Err(AugmentError::UnknownAugmentation(name.to_string()));
      }
      if resolved.contains(&augmentation) {
        return Err(AugmentError::DuplicateAugmentation(name.to_string()));
      }
      resolved.push(augmentation);
    }
    debug!(
      "解析得到 {} 个测试时增强: {:?}",
      resolved.len(),
      resolved.iter().map(Augmentation::name).collect::<Vec<_>>()
    );
    Ok(resolved)
  }
}
