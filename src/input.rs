// 该文件是 Pintu （拼图） 项目的一部分。
// src/input.rs - 输入图像
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

use ndarray::Array3;

/// 一张待推理的图像：图像名（不含扩展名）与 (C, H, W) 像素，取值 [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledImage {
  pub key: String,
  pub pixels: Array3<f32>,
}

impl LabeledImage {
  pub fn new(key: impl Into<String>, pixels: Array3<f32>) -> Self {
    Self {
      key: key.into(),
      pixels,
    }
  }

  /// (H, W)
  pub fn size(&self) -> (usize, usize) {
    let (_, height, width) = self.pixels.dim();
    (height, width)
  }
}

#[cfg(feature = "read_image_file")]
mod read_image_file;

#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageDirInput, ImageDirInputError, ImageDirIter, MaskDir, gray_to_mask, rgb_to_chw};
