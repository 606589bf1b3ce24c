// 该文件是 Pintu （拼图） 项目的一部分。
// src/aggregate.rs - 切片预测累积与整图拼接
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

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ndarray::{Array2, s};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error};

use crate::ProbabilityMap;
use crate::tile::{TileConfig, TileError, TileGeometry, TileId, TileSpec};

#[derive(Error, Debug)]
pub enum AggregateError {
  #[error("图像 {key} 的切片 {tile} 被重复提交")]
  DuplicateTileError { key: String, tile: TileId },
  #[error("仍有 {} 张图像的切片未合并: {:?}", .pending.len(), .pending)]
  PendingTilesError { pending: Vec<(String, usize)> },
  #[error("图像 {0} 尚未登记尺寸")]
  UnknownImageError(String),
  #[error("图像 {key} 已按 {registered:?} 登记, 不能再按 {requested:?} 登记")]
  GeometryMismatchError {
    key: String,
    registered: (usize, usize),
    requested: (usize, usize),
  },
  #[error("切片错误: {0}")]
  TileError(#[from] TileError),
}

/// `try_flush` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Flush {
  /// 全部切片已到齐，返回拼接好的整图
  Complete(ProbabilityMap),
  /// 仍在等待切片；未登记的图像 `expected` 为 0
  Pending { received: usize, expected: usize },
}

impl Flush {
  pub fn is_complete(&self) -> bool {
    matches!(self, Flush::Complete(_))
  }

  pub fn into_map(self) -> Option<ProbabilityMap> {
    match self {
      Flush::Complete(map) => Some(map),
      Flush::Pending { .. } => None,
    }
  }
}

/// 某个图像尺寸下的切片几何及其期望切片集合
#[derive(Debug)]
struct Tiling {
  geometry: Arc<TileGeometry>,
  specs: BTreeMap<TileId, TileSpec>,
}

#[derive(Debug)]
struct Accumulator {
  tiling: Arc<Tiling>,
  tiles: BTreeMap<TileId, Array2<f32>>,
  // 已被拼接并移出索引；持有旧引用的调用者需要重新获取
  flushed: bool,
}

/// 按图像累积去边后的切片预测，切片到齐时拼接成整图
///
/// 每张图像先用 `begin` 登记尺寸，期望的切片集合由该尺寸与切片参数决定，
/// 同一个聚合器可以同时容纳不同尺寸的图像。
///
/// 外层读写锁只用于按图像名查找累加器，提交与拼接在每张图像自己的互斥锁内完成，
/// 不同图像之间互不竞争。加锁顺序固定为“图像锁 -> 外层写锁”，
/// 任何路径都不会在持有外层锁时等待图像锁。
pub struct Aggregator {
  config: TileConfig,
  tilings: RwLock<HashMap<(usize, usize), Arc<Tiling>>>,
  images: RwLock<HashMap<String, Arc<Mutex<Accumulator>>>>,
}

impl Aggregator {
  pub fn new(config: TileConfig) -> Result<Self, TileError> {
    config.validate()?;
    Ok(Self {
      config,
      tilings: RwLock::new(HashMap::new()),
      images: RwLock::new(HashMap::new()),
    })
  }

  pub fn config(&self) -> &TileConfig {
    &self.config
  }

  fn tiling(&self, height: usize, width: usize) -> Result<Arc<Tiling>, TileError> {
    if let Some(tiling) = self.tilings.read().get(&(height, width)) {
      return Ok(tiling.clone());
    }
    let geometry = TileGeometry::new(height, width, &self.config)?;
    let specs = geometry.tiles().into_iter().map(|spec| (spec.id, spec)).collect();
    let tiling = Arc::new(Tiling {
      geometry: Arc::new(geometry),
      specs,
    });
    Ok(
      self
        .tilings
        .write()
        .entry((height, width))
        .or_insert(tiling)
        .clone(),
    )
  }

  /// 给定图像尺寸下的切片几何，同一尺寸共享同一份
  pub fn geometry(&self, height: usize, width: usize) -> Result<Arc<TileGeometry>, TileError> {
    Ok(self.tiling(height, width)?.geometry.clone())
  }

  /// 登记一张图像的尺寸；对正在累积的图像重复登记同一尺寸不会产生影响
  pub fn begin(&self, key: &str, height: usize, width: usize) -> Result<Arc<TileGeometry>, AggregateError> {
    let tiling = self.tiling(height, width)?;
    loop {
      let existing = self.images.read().get(key).cloned();
      let slot = match existing {
        Some(slot) => slot,
        None => self
          .images
          .write()
          .entry(key.to_string())
          .or_insert_with(|| {
            Arc::new(Mutex::new(Accumulator {
              tiling: tiling.clone(),
              tiles: BTreeMap::new(),
              flushed: false,
            }))
          })
          .clone(),
      };

      let accumulator = slot.lock();
      if accumulator.flushed {
        continue;
      }
      let registered = accumulator.tiling.geometry.image_size();
      if registered != (height, width) {
        error!(
          "图像 {} 已按 {:?} 登记, 不能再按 {:?} 登记",
          key,
          registered,
          (height, width)
        );
        return Err(AggregateError::GeometryMismatchError {
          key: key.to_string(),
          registered,
          requested: (height, width),
        });
      }
      return Ok(accumulator.tiling.geometry.clone());
    }
  }

  /// 提交一个去边后的切片预测，图像必须已经 `begin`
  pub fn submit(&self, key: &str, tile: TileId, prediction: Array2<f32>) -> Result<(), AggregateError> {
    loop {
      let slot = self.images.read().get(key).cloned();
      let Some(slot) = slot else {
        error!("图像 {} 未登记尺寸就提交了切片 {}", key, tile);
        return Err(AggregateError::UnknownImageError(key.to_string()));
      };
      let mut accumulator = slot.lock();
      if accumulator.flushed {
        continue;
      }

      let tiling = accumulator.tiling.clone();
      let geometry = &tiling.geometry;
      if !tiling.specs.contains_key(&tile) {
        return Err(
          TileError::BoundsError(format!(
            "切片 {} 不属于图像 {} 的 {}x{} 切片网格",
            tile,
            key,
            geometry.rows(),
            geometry.cols()
          ))
          .into(),
        );
      }
      if prediction.dim() != geometry.valid_size() {
        return Err(
          TileError::ShapeError(format!(
            "去边后的切片预测应为 {:?}, 实际为 {:?}",
            geometry.valid_size(),
            prediction.dim()
          ))
          .into(),
        );
      }

      return match accumulator.tiles.entry(tile) {
        Entry::Occupied(_) => {
          error!("图像 {} 的切片 {} 被重复提交", key, tile);
          Err(AggregateError::DuplicateTileError {
            key: key.to_string(),
            tile,
          })
        }
        Entry::Vacant(vacant) => {
          vacant.insert(prediction);
          debug!(
            "图像 {} 收到切片 {} ({}/{})",
            key,
            tile,
            accumulator.tiles.len(),
            tiling.specs.len()
          );
          Ok(())
        }
      };
    }
  }

  /// 切片集合与期望集合相等时拼接整图并清除该图像的状态
  pub fn try_flush(&self, key: &str) -> Result<Flush, AggregateError> {
    let slot = self.images.read().get(key).cloned();
    let Some(slot) = slot else {
      return Ok(Flush::Pending {
        received: 0,
        expected: 0,
      });
    };

    let mut accumulator = slot.lock();
    let tiling = accumulator.tiling.clone();
    let expected = tiling.specs.len();
    let received = accumulator.tiles.len();
    if accumulator.flushed {
      return Ok(Flush::Pending {
        received: 0,
        expected,
      });
    }
    if received != expected || !accumulator.tiles.keys().eq(tiling.specs.keys()) {
      return Ok(Flush::Pending { received, expected });
    }

    let map = stitch(&tiling, &accumulator.tiles);
    accumulator.tiles.clear();
    accumulator.flushed = true;
    {
      let mut images = self.images.write();
      if images.get(key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
        images.remove(key);
      }
    }
    drop(accumulator);

    debug!("图像 {} 的 {} 个切片已拼接", key, expected);
    Ok(Flush::Complete(map))
  }

  pub fn submit_and_flush(
    &self,
    key: &str,
    tile: TileId,
    prediction: Array2<f32>,
  ) -> Result<Flush, AggregateError> {
    self.submit(key, tile, prediction)?;
    self.try_flush(key)
  }

  /// 已登记但尚未拼接的图像及其已收到的切片数，按图像名排序
  pub fn pending(&self) -> Vec<(String, usize)> {
    let slots: Vec<(String, Arc<Mutex<Accumulator>>)> = self
      .images
      .read()
      .iter()
      .map(|(key, slot)| (key.clone(), slot.clone()))
      .collect();

    let mut pending: Vec<(String, usize)> = slots
      .into_iter()
      .filter_map(|(key, slot)| {
        let accumulator = slot.lock();
        (!accumulator.flushed).then(|| (key, accumulator.tiles.len()))
      })
      .collect();
    pending.sort();
    pending
  }

  /// 运行结束时调用：任何残留的累加器都说明有切片丢失、错投或重复
  pub fn assert_no_pending(&self) -> Result<(), AggregateError> {
    let pending = self.pending();
    if pending.is_empty() {
      return Ok(());
    }
    error!("运行结束时仍有 {} 张图像未完成拼接: {:?}", pending.len(), pending);
    Err(AggregateError::PendingTilesError { pending })
  }
}

// 纯放置，不做融合：每个像素只由一个切片的有效区域写入
fn stitch(tiling: &Tiling, tiles: &BTreeMap<TileId, Array2<f32>>) -> ProbabilityMap {
  let mut map = Array2::zeros(tiling.geometry.image_size());
  for (id, prediction) in tiles {
    let valid = tiling.specs[id].valid;
    map
      .slice_mut(s![
        valid.y..valid.y + valid.height,
        valid.x..valid.x + valid.width
      ])
      .assign(&prediction.slice(s![..valid.height, ..valid.width]));
  }
  map
}
