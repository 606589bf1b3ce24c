// 该文件是 Pintu （拼图） 项目的一部分。
// tests/common/mod.rs - 集成测试的公共工具
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

#![allow(dead_code)]

use ndarray::{Array2, Array3};
use pintu::config::ExperimentConfig;
use pintu::model::ModelParams;
use pintu::tile::TileConfig;

/// 在 `height x width` 的画布上点亮 `[y0, y1) x [x0, x1)` 矩形
pub fn rectangle_mask(
  height: usize,
  width: usize,
  (y0, y1): (usize, usize),
  (x0, x1): (usize, usize),
) -> Array2<u8> {
  Array2::from_shape_fn((height, width), |(y, x)| {
    u8::from((y0..y1).contains(&y) && (x0..x1).contains(&x))
  })
}

/// 掩码为 1 的像素在三个通道上都为白色
pub fn mask_to_pixels(mask: &Array2<u8>) -> Array3<f32> {
  let (height, width) = mask.dim();
  Array3::from_shape_fn((3, height, width), |(_, y, x)| f32::from(mask[(y, x)]))
}

pub fn brightness_experiment(name: &str, tile: TileConfig, tta: &[&str], accuracy: f64) -> ExperimentConfig {
  ExperimentConfig {
    name: name.to_string(),
    model: None,
    params: ModelParams::new().with("gain", 12.0).with("offset", 0.5),
    tile,
    test_time_aug: tta.iter().map(|s| s.to_string()).collect(),
    batch_size: 4,
    validation_accuracy: Some(accuracy),
    channels: 3,
  }
}

/// 每个去边切片填满同一个值，值由图像序号与切片位置决定
pub fn tile_value(image: usize, row: usize, col: usize) -> f32 {
  ((image * 31 + row * 7 + col) % 100) as f32 / 100.0
}
