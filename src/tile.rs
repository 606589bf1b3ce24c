// 该文件是 Pintu （拼图） 项目的一部分。
// src/tile.rs - 图像切片几何、填充与边框裁剪
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

use std::collections::BTreeSet;
use std::fmt;

use ndarray::{Array2, Array3, ArrayD, ArrayView2, ArrayView3, ArrayViewD, Ix2, Slice, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TileError {
  #[error("形状错误: {0}")]
  ShapeError(String),
  #[error("越界错误: {0}")]
  BoundsError(String),
  #[error("切片配置错误: {0}")]
  ConfigError(String),
}

/// 填充方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadMode {
  /// 以 0 填充
  #[default]
  Zero,
  /// 复制最近的边缘像素
  Edge,
  /// 以边缘为轴镜像（不重复边缘像素）
  Reflect,
}

/// 切片参数
///
/// `border` 是模型输出中每条边需要丢弃的像素数，
/// 有效区域大小为 `tile - 2 * border`，相邻切片的步长等于有效区域大小。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
  pub tile_height: usize,
  pub tile_width: usize,
  #[serde(default)]
  pub border: usize,
  /// 显式步长 (h, w)，缺省时等于有效区域大小
  #[serde(default)]
  pub stride: Option<(usize, usize)>,
  #[serde(default)]
  pub pad_mode: PadMode,
}

impl TileConfig {
  pub fn new(tile_height: usize, tile_width: usize, border: usize) -> Self {
    Self {
      tile_height,
      tile_width,
      border,
      stride: None,
      pad_mode: PadMode::default(),
    }
  }

  pub fn with_stride(mut self, height: usize, width: usize) -> Self {
    self.stride = Some((height, width));
    self
  }

  pub fn with_pad_mode(mut self, mode: PadMode) -> Self {
    self.pad_mode = mode;
    self
  }

  pub fn tile_size(&self) -> (usize, usize) {
    (self.tile_height, self.tile_width)
  }

  /// 去边后的有效区域大小，调用前需保证配置已通过校验
  pub fn valid_size(&self) -> (usize, usize) {
    (
      self.tile_height - 2 * self.border,
      self.tile_width - 2 * self.border,
    )
  }

  pub fn validate(&self) -> Result<(), TileError> {
    if self.tile_height == 0 || self.tile_width == 0 {
      return Err(TileError::ConfigError(format!(
        "切片大小必须为正数, 实际为 {}x{}",
        self.tile_height, self.tile_width
      )));
    }

    check_border(self.border, self.tile_height, self.tile_width)?;

    if let Some(stride) = self.stride {
      let valid = self.valid_size();
      if stride.0 < valid.0 || stride.1 < valid.1 {
        return Err(TileError::ConfigError(format!(
          "步长 {:?} 小于有效区域 {:?}, 去边后的切片会相互重叠",
          stride, valid
        )));
      }
      if stride != valid {
        return Err(TileError::ConfigError(format!(
          "步长 {:?} 大于有效区域 {:?}, 切片之间会留下空隙",
          stride, valid
        )));
      }
    }

    Ok(())
  }
}

fn check_border(border: usize, height: usize, width: usize) -> Result<(), TileError> {
  if 2 * border >= height || 2 * border >= width {
    return Err(TileError::ConfigError(format!(
      "边框 {} 必须小于空间尺寸 {}x{} 的一半",
      border, height, width
    )));
  }
  Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Paddings {
  pub top: usize,
  pub bottom: usize,
  pub left: usize,
  pub right: usize,
}

/// 切片在网格中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileId {
  pub row: usize,
  pub col: usize,
}

impl TileId {
  pub fn new(row: usize, col: usize) -> Self {
    Self { row, col }
  }
}

impl fmt::Display for TileId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {})", self.row, self.col)
  }
}

/// 矩形区域，`y`/`x` 为左上角
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
  pub y: usize,
  pub x: usize,
  pub height: usize,
  pub width: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
  pub id: TileId,
  /// 切片在填充后图像中的左上角
  pub origin: (usize, usize),
  /// 去边后保留的区域，原图坐标
  pub valid: Rect,
}

/// 一张图像在给定切片参数下的完整几何
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGeometry {
  height: usize,
  width: usize,
  config: TileConfig,
  rows: usize,
  cols: usize,
}

impl TileGeometry {
  pub fn new(height: usize, width: usize, config: &TileConfig) -> Result<Self, TileError> {
    config.validate()?;
    if height == 0 || width == 0 {
      return Err(TileError::ConfigError(format!(
        "图像尺寸必须为正数, 实际为 {}x{}",
        height, width
      )));
    }

    let (valid_h, valid_w) = config.valid_size();
    let rows = height.div_ceil(valid_h);
    let cols = width.div_ceil(valid_w);
    debug!(
      "图像 {}x{} 切分为 {}x{} 个切片, 切片大小 {}x{}, 边框 {}",
      height, width, rows, cols, config.tile_height, config.tile_width, config.border
    );

    Ok(Self {
      height,
      width,
      config: config.clone(),
      rows,
      cols,
    })
  }

  pub fn config(&self) -> &TileConfig {
    &self.config
  }

  pub fn image_size(&self) -> (usize, usize) {
    (self.height, self.width)
  }

  pub fn tile_size(&self) -> (usize, usize) {
    self.config.tile_size()
  }

  pub fn valid_size(&self) -> (usize, usize) {
    self.config.valid_size()
  }

  pub fn border(&self) -> usize {
    self.config.border
  }

  pub fn rows(&self) -> usize {
    self.rows
  }

  pub fn cols(&self) -> usize {
    self.cols
  }

  pub fn tile_count(&self) -> usize {
    self.rows * self.cols
  }

  pub fn padded_size(&self) -> (usize, usize) {
    let (valid_h, valid_w) = self.valid_size();
    let border = self.border();
    (
      self.rows * valid_h + 2 * border,
      self.cols * valid_w + 2 * border,
    )
  }

  pub fn paddings(&self) -> Paddings {
    let (padded_h, padded_w) = self.padded_size();
    let border = self.border();
    Paddings {
      top: border,
      bottom: padded_h - self.height - border,
      left: border,
      right: padded_w - self.width - border,
    }
  }

  /// 完整的切片集合，仅由图像尺寸和切片参数决定
  pub fn expected_tiles(&self) -> BTreeSet<TileId> {
    (0..self.rows)
      .flat_map(|row| (0..self.cols).map(move |col| TileId::new(row, col)))
      .collect()
  }

  pub fn contains(&self, id: TileId) -> bool {
    id.row < self.rows && id.col < self.cols
  }

  pub fn tile(&self, id: TileId) -> Result<TileSpec, TileError> {
    if !self.contains(id) {
      return Err(TileError::BoundsError(format!(
        "切片 {} 超出 {}x{} 的切片网格",
        id, self.rows, self.cols
      )));
    }

    let (valid_h, valid_w) = self.valid_size();
    let y = id.row * valid_h;
    let x = id.col * valid_w;
    Ok(TileSpec {
      id,
      origin: (y, x),
      valid: Rect {
        y,
        x,
        height: valid_h.min(self.height - y),
        width: valid_w.min(self.width - x),
      },
    })
  }

  /// 按行优先顺序列出所有切片
  pub fn tiles(&self) -> Vec<TileSpec> {
    let (valid_h, valid_w) = self.valid_size();
    let mut specs = Vec::with_capacity(self.tile_count());
    for row in 0..self.rows {
      for col in 0..self.cols {
        let (y, x) = (row * valid_h, col * valid_w);
        specs.push(TileSpec {
          id: TileId::new(row, col),
          origin: (y, x),
          valid: Rect {
            y,
            x,
            height: valid_h.min(self.height - y),
            width: valid_w.min(self.width - x),
          },
        });
      }
    }
    specs
  }

  /// 按本几何的填充量填充图像，图像必须为 (C, H, W) 且尺寸一致
  pub fn pad(&self, image: ArrayViewD<'_, f32>, channels: usize) -> Result<Array3<f32>, TileError> {
    let shape = image.shape();
    if shape.len() == 3 && (shape[1], shape[2]) != (self.height, self.width) {
      error!(
        "图像尺寸 {}x{} 与切片几何 {}x{} 不一致",
        shape[1], shape[2], self.height, self.width
      );
      return Err(TileError::ShapeError(format!(
        "图像尺寸 {}x{} 与切片几何 {}x{} 不一致",
        shape[1], shape[2], self.height, self.width
      )));
    }
    pad_image(image, channels, &self.paddings(), self.config.pad_mode)
  }

  /// 把填充后的图像切成全部切片
  pub fn cut(&self, padded: ArrayView3<'_, f32>) -> Result<Vec<(TileSpec, Array3<f32>)>, TileError> {
    let (_, padded_h, padded_w) = padded.dim();
    if (padded_h, padded_w) != self.padded_size() {
      return Err(TileError::ShapeError(format!(
        "填充后图像尺寸应为 {:?}, 实际为 {}x{}",
        self.padded_size(),
        padded_h,
        padded_w
      )));
    }

    self
      .tiles()
      .into_iter()
      .map(|spec| get_tile(padded, self.tile_size(), spec.origin).map(|tile| (spec, tile)))
      .collect()
  }

  /// 去掉单个切片预测的边框，输入必须为完整切片大小
  pub fn trim_prediction(&self, prediction: ArrayView2<'_, f32>) -> Result<Array2<f32>, TileError> {
    if prediction.dim() != self.tile_size() {
      return Err(TileError::ShapeError(format!(
        "切片预测尺寸应为 {:?}, 实际为 {:?}",
        self.tile_size(),
        prediction.dim()
      )));
    }
    remove_tile_borders(prediction.into_dyn(), self.border())?
      .into_dimensionality::<Ix2>()
      .map_err(|e| TileError::ShapeError(e.to_string()))
  }
}

/// 把 `i` 映射回长度为 `n` 的轴上的源下标
fn source_index(i: isize, n: usize, mode: PadMode) -> Option<usize> {
  let n = n as isize;
  if (0..n).contains(&i) {
    return Some(i as usize);
  }
  match mode {
    PadMode::Zero => None,
    PadMode::Edge => Some(i.clamp(0, n - 1) as usize),
    PadMode::Reflect => {
      if n == 1 {
        return Some(0);
      }
      let period = 2 * (n - 1);
      let i = i.rem_euclid(period);
      let mirrored = if i < n { i } else { period - i };
      Some(mirrored as usize)
    }
  }
}

/// 填充 (C, H, W) 图像
pub fn pad_image(
  image: ArrayViewD<'_, f32>,
  channels: usize,
  paddings: &Paddings,
  mode: PadMode,
) -> Result<Array3<f32>, TileError> {
  if image.ndim() != 3 {
    error!("图像维度应为 3 (C, H, W), 实际为 {}", image.ndim());
    return Err(TileError::ShapeError(format!(
      "图像维度应为 3 (C, H, W), 实际形状为 {:?}",
      image.shape()
    )));
  }
  if image.shape()[0] != channels {
    return Err(TileError::ShapeError(format!(
      "图像通道数应为 {}, 实际为 {}",
      channels,
      image.shape()[0]
    )));
  }

  let (height, width) = (image.shape()[1], image.shape()[2]);
  let out_h = height + paddings.top + paddings.bottom;
  let out_w = width + paddings.left + paddings.right;

  let rows: Vec<Option<usize>> = (0..out_h)
    .map(|y| source_index(y as isize - paddings.top as isize, height, mode))
    .collect();
  let cols: Vec<Option<usize>> = (0..out_w)
    .map(|x| source_index(x as isize - paddings.left as isize, width, mode))
    .collect();

  Ok(Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
    match (rows[y], cols[x]) {
      (Some(sy), Some(sx)) => image[[c, sy, sx]],
      _ => 0.0,
    }
  }))
}

/// 从填充后的图像中取出一个切片
pub fn get_tile(
  image: ArrayView3<'_, f32>,
  tile_size: (usize, usize),
  origin: (usize, usize),
) -> Result<Array3<f32>, TileError> {
  let (_, height, width) = image.dim();
  let (tile_h, tile_w) = tile_size;
  let (y, x) = origin;
  if y + tile_h > height || x + tile_w > width {
    return Err(TileError::BoundsError(format!(
      "切片 (原点 {:?}, 大小 {:?}) 超出图像 {}x{}",
      origin, tile_size, height, width
    )));
  }
  Ok(image.slice(s![.., y..y + tile_h, x..x + tile_w]).to_owned())
}

/// 裁掉最后两个轴两端各 `border` 个像素，适用于任意批量维度
pub fn remove_tile_borders<A: Clone>(
  tensor: ArrayViewD<'_, A>,
  border: usize,
) -> Result<ArrayD<A>, TileError> {
  let ndim = tensor.ndim();
  if ndim < 2 {
    return Err(TileError::ShapeError(format!(
      "至少需要两个空间维度, 实际形状为 {:?}",
      tensor.shape()
    )));
  }
  check_border(border, tensor.shape()[ndim - 2], tensor.shape()[ndim - 1])?;
  if border == 0 {
    return Ok(tensor.to_owned());
  }

  Ok(
    tensor
      .slice_each_axis(|axis| {
        if axis.axis.index() >= ndim - 2 {
          Slice::from(border..axis.len - border)
        } else {
          Slice::from(..)
        }
      })
      .to_owned(),
  )
}
