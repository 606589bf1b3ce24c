// 该文件是 Pintu （拼图） 项目的一部分。
// src/ensemble.rs - 多模型、多增强概率图的加权集成
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

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use ndarray::Array2;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::ProbabilityMap;
use crate::store::{ProbStore, RunManifest, StoreError, dequantize};

const PROGRESS_INTERVAL: usize = 1000;

#[derive(Error, Debug)]
pub enum EnsembleError {
  #[error("运行 {run} 缺少图像 {key} 的概率图, 无法集成")]
  MissingRunError { run: String, key: String },
  #[error("集成配置错误: {0}")]
  ConfigError(String),
  #[error("运行 {run} 中图像 {key} 的概率图尺寸为 {actual:?}, 期望 {expected:?}")]
  ShapeMismatch {
    run: String,
    key: String,
    actual: (usize, usize),
    expected: (usize, usize),
  },
  #[error("存储错误: {0}")]
  StoreError(#[from] StoreError),
}

/// 由各运行记录的验证精度导出权重：`w_i = acc_i / Σ acc`
pub fn derive_weights(accuracies: &[f64]) -> Result<Vec<f64>, EnsembleError> {
  if let Some(bad) = accuracies.iter().find(|a| !a.is_finite() || **a < 0.0) {
    return Err(EnsembleError::ConfigError(format!(
      "验证精度必须为非负有限数, 实际为 {}",
      bad
    )));
  }
  let total: f64 = accuracies.iter().sum();
  if total <= 0.0 {
    return Err(EnsembleError::ConfigError(
      "验证精度之和为 0, 无法导出权重".to_string(),
    ));
  }
  Ok(accuracies.iter().map(|a| a / total).collect())
}

/// 一组运行的加权集成，权重顺序与运行顺序一致
pub struct Ensemble {
  store: ProbStore,
  runs: Vec<String>,
  manifests: Vec<RunManifest>,
  weights: Vec<f64>,
}

impl Ensemble {
  /// 读取每个运行的清单并从记录的验证精度导出权重
  pub fn new(store: ProbStore, runs: Vec<String>) -> Result<Self, EnsembleError> {
    let manifests = Self::read_manifests(&store, &runs)?;
    let accuracies: Vec<f64> = manifests.iter().map(|m| m.accuracy).collect();
    let weights = derive_weights(&accuracies)?;
    Self::assemble(store, runs, manifests, weights)
  }

  pub fn with_weights(
    store: ProbStore,
    runs: Vec<String>,
    weights: Vec<f64>,
  ) -> Result<Self, EnsembleError> {
    if weights.len() != runs.len() {
      return Err(EnsembleError::ConfigError(format!(
        "权重个数 {} 与运行个数 {} 不一致",
        weights.len(),
        runs.len()
      )));
    }
    if weights.iter().any(|w| !w.is_finite()) {
      return Err(EnsembleError::ConfigError(format!(
        "权重必须为有限数: {:?}",
        weights
      )));
    }
    let manifests = Self::read_manifests(&store, &runs)?;
    Self::assemble(store, runs, manifests, weights)
  }

  fn read_manifests(store: &ProbStore, runs: &[String]) -> Result<Vec<RunManifest>, EnsembleError> {
    if runs.is_empty() {
      return Err(EnsembleError::ConfigError("至少需要一个运行".to_string()));
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = runs.iter().find(|run| !seen.insert(run.as_str())) {
      return Err(EnsembleError::ConfigError(format!(
        "运行 {} 重复出现",
        duplicate
      )));
    }
    runs
      .iter()
      .map(|run| store.read_manifest(run).map_err(EnsembleError::from))
      .collect()
  }

  fn assemble(
    store: ProbStore,
    runs: Vec<String>,
    manifests: Vec<RunManifest>,
    weights: Vec<f64>,
  ) -> Result<Self, EnsembleError> {
    for (run, weight) in runs.iter().zip(&weights) {
      info!("集成成员 {}: 权重 {:.4}", run, weight);
    }

    Ok(Self {
      store,
      runs,
      manifests,
      weights,
    })
  }

  pub fn runs(&self) -> &[String] {
    &self.runs
  }

  pub fn weights(&self) -> &[f64] {
    &self.weights
  }

  /// 全部运行中出现过的图像之并集；任一运行缺少其中某张图即报错
  pub fn image_keys(&self) -> Result<Vec<String>, EnsembleError> {
    let per_run = self
      .runs
      .iter()
      .map(|run| Ok(self.store.list_keys(run)?.into_iter().collect::<BTreeSet<_>>()))
      .collect::<Result<Vec<_>, EnsembleError>>()?;
    let union: BTreeSet<String> = per_run.iter().flatten().cloned().collect();

    for (run, keys) in self.runs.iter().zip(&per_run) {
      if let Some(key) = union.difference(keys).next() {
        error!(
          "运行 {} 有 {} 张概率图, 并集为 {} 张, 缺少 {}",
          run,
          keys.len(),
          union.len(),
          key
        );
        return Err(EnsembleError::MissingRunError {
          run: run.clone(),
          key: key.clone(),
        });
      }
    }
    Ok(union.into_iter().collect())
  }

  /// 逐像素计算 `Σ weight_i * map_i`，先反量化再以浮点累加，不做逐图归一化
  ///
  /// 每张图的尺寸以第一个运行中的概率图为准，各运行必须一致。
  pub fn combine(&self, key: &str) -> Result<ProbabilityMap, EnsembleError> {
    let mut combined: Option<Array2<f32>> = None;
    for (run, &weight) in self.runs.iter().zip(&self.weights) {
      let quantized = match self.store.load_quantized(run, key) {
        Ok(map) => map,
        Err(StoreError::MissingMap { run, key }) => {
          error!("运行 {} 缺少图像 {} 的概率图", run, key);
          return Err(EnsembleError::MissingRunError { run, key });
        }
        Err(e) => return Err(e.into()),
      };
      let combined = combined.get_or_insert_with(|| Array2::zeros(quantized.dim()));
      if quantized.dim() != combined.dim() {
        return Err(EnsembleError::ShapeMismatch {
          run: run.clone(),
          key: key.to_string(),
          actual: quantized.dim(),
          expected: combined.dim(),
        });
      }

      let weight = weight as f32;
      combined.zip_mut_with(&quantized, |acc, &q| *acc += weight * dequantize(q));
    }
    combined.ok_or_else(|| EnsembleError::ConfigError("至少需要一个运行".to_string()))
  }

  /// 并行集成全部图像，写入新的运行目录并记录集成清单，返回新的运行 ID
  pub fn run(&self) -> Result<String, EnsembleError> {
    let started = Instant::now();
    let keys = self.image_keys()?;
    if keys.is_empty() {
      warn!("运行 {} 中没有概率图", self.runs[0]);
    }

    let output = self.store.create_run()?;
    info!("开始集成 {} 张图像, 输出到运行 {}", keys.len(), output);

    let done = AtomicUsize::new(0);
    keys.par_iter().try_for_each(|key| -> Result<(), EnsembleError> {
      let combined = self.combine(key)?;
      self.store.save_map(&output, key, combined.view())?;
      let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
      if finished % PROGRESS_INTERVAL == 0 {
        info!("已集成 {}/{} 张图像, 耗时 {:.2?}", finished, keys.len(), started.elapsed());
      }
      Ok(())
    })?;

    let manifest = RunManifest::ensemble(
      self.runs.iter().cloned().zip(self.manifests.iter().cloned()).collect(),
      self.weights.clone(),
    );
    self.store.write_manifest(&output, &manifest)?;

    info!(
      "集成完成: {} 个运行, {} 张图像, 耗时 {:.2?}",
      self.runs.len(),
      keys.len(),
      started.elapsed()
    );
    Ok(output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::RunMember;
  use ndarray::arr2;
  use std::fs;

  fn write_run(store: &ProbStore, run: &str, accuracy: f64, maps: &[(&str, Array2<f32>)]) {
    let manifest = RunManifest::single(RunMember {
      experiment: format!("Brightness_{}", run),
      augmentation: "none".to_string(),
      accuracy,
    });
    store.write_manifest(run, &manifest).unwrap();
    for (key, map) in maps {
      store.save_map(run, key, map.view()).unwrap();
    }
  }

  #[test]
  fn weights_follow_recorded_accuracy() {
    let weights = derive_weights(&[0.75, 0.25]).unwrap();
    assert_eq!(weights, vec![0.75, 0.25]);
    assert!(derive_weights(&[0.0, 0.0]).is_err());
    assert!(derive_weights(&[f64::NAN]).is_err());
    assert!(derive_weights(&[-0.5, 1.0]).is_err());
  }

  #[test]
  fn single_run_with_unit_weight_is_the_dequantized_map() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    let map = arr2(&[[0.129f32, 0.5], [0.999, 0.0]]);
    write_run(&store, "a", 0.99, &[("car", map.clone())]);

    let ensemble = Ensemble::new(store.clone(), vec!["a".to_string()]).unwrap();
    assert_eq!(ensemble.weights(), &[1.0]);
    let combined = ensemble.combine("car").unwrap();
    assert_eq!(combined, store.load_map("a", "car").unwrap());
    assert_eq!(combined, arr2(&[[0.12f32, 0.5], [0.99, 0.0]]));
  }

  #[test]
  fn weighted_sum_of_two_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    write_run(&store, "a", 0.3, &[("car", Array2::from_elem((2, 2), 1.0))]);
    write_run(&store, "b", 0.1, &[("car", Array2::from_elem((2, 2), 0.2))]);

    let ensemble = Ensemble::new(store, vec!["a".to_string(), "b".to_string()]).unwrap();
    let combined = ensemble.combine("car").unwrap();
    for value in combined.iter() {
      assert!((value - (0.75 + 0.25 * 0.2)).abs() < 1e-6);
    }
  }

  #[test]
  fn missing_map_in_any_run_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    write_run(
      &store,
      "a",
      0.5,
      &[
        ("car", Array2::zeros((2, 2))),
        ("bus", Array2::zeros((2, 2))),
      ],
    );
    write_run(&store, "b", 0.5, &[("car", Array2::zeros((2, 2)))]);

    let ensemble = Ensemble::new(store, vec!["a".to_string(), "b".to_string()]).unwrap();
    assert!(ensemble.combine("car").is_ok());
    match ensemble.combine("bus") {
      Err(EnsembleError::MissingRunError { run, key }) => {
        assert_eq!((run.as_str(), key.as_str()), ("b", "bus"));
      }
      other => panic!("应当报告缺失的运行, 实际为 {:?}", other.map(|m| m.dim())),
    }
    assert!(matches!(ensemble.run(), Err(EnsembleError::MissingRunError { .. })));
  }

  #[test]
  fn image_missing_from_an_earlier_run_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    write_run(&store, "a", 0.5, &[("car", Array2::zeros((2, 2)))]);
    write_run(
      &store,
      "b",
      0.5,
      &[
        ("car", Array2::zeros((2, 2))),
        ("bus", Array2::zeros((3, 4))),
      ],
    );

    let ensemble = Ensemble::new(store.clone(), vec!["a".to_string(), "b".to_string()]).unwrap();
    match ensemble.image_keys() {
      Err(EnsembleError::MissingRunError { run, key }) => {
        assert_eq!((run.as_str(), key.as_str()), ("a", "bus"));
      }
      other => panic!("应当报告缺失的运行, 实际为 {:?}", other),
    }
    assert!(matches!(ensemble.run(), Err(EnsembleError::MissingRunError { .. })));

    let mut runs: Vec<_> = fs::read_dir(dir.path())
      .unwrap()
      .map(|entry| entry.unwrap().file_name().into_string().unwrap())
      .collect();
    runs.sort();
    assert_eq!(runs, vec!["a", "b"]);
  }

  #[test]
  fn maps_of_different_sizes_combine_per_image() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    write_run(
      &store,
      "a",
      0.5,
      &[
        ("car", Array2::from_elem((2, 2), 0.4)),
        ("bus", Array2::from_elem((3, 5), 0.8)),
      ],
    );
    write_run(
      &store,
      "b",
      0.5,
      &[
        ("car", Array2::from_elem((2, 2), 0.2)),
        ("bus", Array2::from_elem((5, 3), 0.8)),
      ],
    );

    let ensemble = Ensemble::new(store, vec!["a".to_string(), "b".to_string()]).unwrap();
    assert_eq!(ensemble.image_keys().unwrap(), vec!["bus", "car"]);
    assert_eq!(ensemble.combine("car").unwrap().dim(), (2, 2));
    assert!(matches!(
      ensemble.combine("bus"),
      Err(EnsembleError::ShapeMismatch { actual: (5, 3), expected: (3, 5), .. })
    ));
  }

  #[test]
  fn explicit_weights_must_align_with_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    write_run(&store, "a", 0.5, &[]);
    assert!(matches!(
      Ensemble::with_weights(store.clone(), vec!["a".to_string()], vec![0.5, 0.5]),
      Err(EnsembleError::ConfigError(_))
    ));
    assert!(matches!(
      Ensemble::new(store.clone(), vec!["a".to_string(), "a".to_string()]),
      Err(EnsembleError::ConfigError(_))
    ));
    assert!(matches!(
      Ensemble::new(store, vec!["missing".to_string()]),
      Err(EnsembleError::StoreError(StoreError::MissingManifest(_)))
    ));
  }

  #[test]
  fn run_persists_maps_and_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    write_run(&store, "a", 0.6, &[("car", Array2::from_elem((2, 2), 0.9))]);
    write_run(&store, "b", 0.4, &[("car", Array2::from_elem((2, 2), 0.4))]);

    let ensemble = Ensemble::new(store.clone(), vec!["a".to_string(), "b".to_string()]).unwrap();
    let output = ensemble.run().unwrap();

    let manifest = store.read_manifest(&output).unwrap();
    assert_eq!(manifest.constituents, vec!["a", "b"]);
    assert_eq!(manifest.members.len(), 2);
    assert_eq!(manifest.weights, ensemble.weights());
    // 0.6 * 0.9 + 0.4 * 0.4 = 0.70
    let stored = store.load_quantized(&output, "car").unwrap();
    assert!(stored.iter().all(|&q| q == 69 || q == 70));
  }
}
