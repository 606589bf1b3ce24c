// 该文件是 Pintu （拼图） 项目的一部分。
// src/task.rs - 推理、集成与提交任务
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
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::{process, thread};

use anyhow::{Context, anyhow, bail};
use ndarray::{Array2, Array3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregator, Flush};
use crate::augment::Augmentation;
use crate::config::ExperimentConfig;
use crate::rle::THRESHOLD;
use crate::ensemble::Ensemble;
use crate::eval::{MaskSource, MeanDice, dice};
use crate::input::LabeledImage;
use crate::model::{Model, Tile};
use crate::rle::{ScanOrder, binarize, binarize_quantized, encode};
use crate::store::{ProbStore, RunManifest, RunMember};
use crate::submit::save_submission;
use crate::tile::{TileConfig, TileGeometry, TileSpec};

const PROGRESS_INTERVAL: usize = 100;

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 安装 Ctrl-C 处理函数，返回的标志在收到中断信号后置位
///
/// 任务只在两张图像之间检查该标志；30 秒内没有退出则强制结束进程。
pub fn install_interrupt_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
  let flag = Arc::new(AtomicBool::new(false));
  let handler_flag = flag.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    handler_flag.store(true, Ordering::SeqCst);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      process::exit(1);
    });
  })?;
  Ok(flag)
}

/// 一种测试时增强对应一次运行
struct Pass {
  augmentation: Augmentation,
  run: String,
  aggregator: Aggregator,
}

/// 填充并切开一张图，几何由图像自身尺寸决定
fn cut_image(
  image: &LabeledImage,
  config: &TileConfig,
  channels: usize,
) -> anyhow::Result<Vec<(TileSpec, Array3<f32>)>> {
  let (height, width) = image.size();
  let geometry = TileGeometry::new(height, width, config)
    .with_context(|| format!("图像 {} ({}x{}) 无法切片", image.key, height, width))?;
  debug!(
    "图像 {} 尺寸 {}x{}, {}x{} 个切片",
    image.key,
    height,
    width,
    geometry.rows(),
    geometry.cols()
  );
  let padded = geometry
    .pad(image.pixels.view().into_dyn(), channels)
    .with_context(|| format!("图像 {} 填充失败", image.key))?;
  Ok(geometry.cut(padded.view())?)
}

// 同一张图的切片分批并行推理，再由聚合器拼回整图
fn infer_image<M, ME>(
  aggregator: &Aggregator,
  augmentation: &Augmentation,
  key: &str,
  (height, width): (usize, usize),
  tiles: &[(TileSpec, Array3<f32>)],
  model: &M,
  batch_size: usize,
) -> anyhow::Result<Array2<f32>>
where
  ME: std::error::Error + Send + Sync + 'static,
  M: Model<Input = Tile, Output = Array2<f32>, Error = ME> + Sync,
{
  let geometry = aggregator.begin(key, height, width)?;
  tiles
    .par_chunks(batch_size.max(1))
    .try_for_each(|batch| -> anyhow::Result<()> {
      for (spec, tile) in batch {
        let augmented = augmentation.forward(tile.view())?;
        let prediction = model.infer(&augmented)?;
        let restored = augmentation.inverse_2d(prediction.view())?;
        let trimmed = geometry.trim_prediction(restored.view())?;
        aggregator.submit(key, spec.id, trimmed)?;
      }
      Ok(())
    })?;

  match aggregator.try_flush(key)? {
    Flush::Complete(map) => Ok(map),
    Flush::Pending { received, expected } => Err(anyhow!(
      "图像 {} 只收到 {}/{} 个切片",
      key,
      received,
      expected
    )),
  }
}

fn check_accuracy(accuracy: f64) -> anyhow::Result<f64> {
  if !accuracy.is_finite() || !(0.0..=1.0).contains(&accuracy) {
    bail!("验证精度必须在 [0, 1] 内, 实际为 {}", accuracy);
  }
  Ok(accuracy)
}

/// 对输入图像切片推理，每种测试时增强各产生一个运行目录
///
/// 每张图按自身尺寸切片，同一批输入中可以混有不同尺寸的图像。
#[derive(Debug)]
pub struct TileInferenceTask {
  experiment: ExperimentConfig,
  accuracy: Option<f64>,
  frame_number: Option<usize>,
  interrupt: Option<Arc<AtomicBool>>,
}

impl TileInferenceTask {
  pub fn new(experiment: ExperimentConfig) -> Self {
    Self {
      experiment,
      accuracy: None,
      frame_number: None,
      interrupt: None,
    }
  }

  /// 记入清单的验证精度，优先于配置中的 `validation_accuracy`
  pub fn with_accuracy(mut self, accuracy: Option<f64>) -> Self {
    self.accuracy = accuracy;
    self
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
    self.interrupt = Some(interrupt);
    self
  }

  fn interrupted(&self) -> bool {
    self
      .interrupt
      .as_ref()
      .is_some_and(|flag| flag.load(Ordering::SeqCst))
  }

  fn accuracy(&self) -> anyhow::Result<f64> {
    let accuracy = self
      .accuracy
      .or(self.experiment.validation_accuracy)
      .ok_or_else(|| {
        anyhow!(
          "实验 {} 没有验证精度: 请在配置中给出 validation_accuracy 或先在验证集上评估",
          self.experiment.name
        )
      })?;
    check_accuracy(accuracy)
  }

  fn open_passes(&self, store: &ProbStore) -> anyhow::Result<Vec<Pass>> {
    let augmentations = self.experiment.augmentations()?;
    if augmentations.is_empty() {
      bail!("实验 {} 没有配置测试时增强", self.experiment.name);
    }
    augmentations
      .into_iter()
      .map(|augmentation| -> anyhow::Result<Pass> {
        let run = store.create_run()?;
        info!(
          "实验 {} 的增强 {} 写入运行 {}",
          self.experiment.name, augmentation, run
        );
        Ok(Pass {
          augmentation,
          run,
          aggregator: Aggregator::new(self.experiment.tile.clone())?,
        })
      })
      .collect()
  }
}

impl<'a, I, E, M, ME> Task<I, M, &'a ProbStore> for TileInferenceTask
where
  I: IntoIterator<Item = Result<LabeledImage, E>>,
  E: std::error::Error + Send + Sync + 'static,
  ME: std::error::Error + Send + Sync + 'static,
  M: Model<Input = Tile, Output = Array2<f32>, Error = ME> + Sync,
{
  /// 每种增强的运行 ID，顺序与配置一致
  type Output = Vec<String>;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, store: &'a ProbStore) -> Result<Self::Output, Self::Error> {
    info!("开始实验 {} 的切片推理...", self.experiment.name);
    let started = Instant::now();
    let accuracy = self.accuracy()?;
    let mut passes: Option<Vec<Pass>> = None;
    let mut frame_index = 0;

    for image in input {
      let image = image?;
      let now = Instant::now();
      let tiles = cut_image(&image, &self.experiment.tile, self.experiment.channels)?;

      if passes.is_none() {
        passes = Some(self.open_passes(store)?);
      }
      let Some(opened) = &passes else {
        continue;
      };
      for pass in opened {
        let map = infer_image(
          &pass.aggregator,
          &pass.augmentation,
          &image.key,
          image.size(),
          &tiles,
          &model,
          self.experiment.batch_size,
        )?;
        store.save_map(&pass.run, &image.key, map.view())?;
      }
      frame_index += 1;
      debug!("图像 {} 完成, 耗时 {:.2?}", image.key, now.elapsed());
      if frame_index % PROGRESS_INTERVAL == 0 {
        info!("已处理 {} 张图像, 总耗时 {:.2?}", frame_index, started.elapsed());
      }

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if self.interrupted() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    let Some(passes) = passes else {
      bail!("没有输入图像");
    };

    let mut runs = Vec::with_capacity(passes.len());
    for pass in passes {
      pass.aggregator.assert_no_pending()?;
      let manifest = RunManifest::single(RunMember {
        experiment: self.experiment.name.clone(),
        augmentation: pass.augmentation.name(),
        accuracy,
      });
      store.write_manifest(&pass.run, &manifest)?;
      runs.push(pass.run);
    }

    info!(
      "任务完成: {} 张图像, {} 个运行, 耗时 {:.2?}",
      frame_index,
      runs.len(),
      started.elapsed()
    );
    Ok(runs)
  }
}

/// 在带真值掩码的验证集上评估实验，得到逐图 Dice 的平均值
///
/// 不做测试时增强；概率图按 [`THRESHOLD`] 二值化后与掩码比较。
#[derive(Debug)]
pub struct ValidationTask {
  experiment: ExperimentConfig,
  frame_number: Option<usize>,
}

impl ValidationTask {
  pub fn new(experiment: ExperimentConfig) -> Self {
    Self {
      experiment,
      frame_number: None,
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<'a, I, E, M, ME, S> Task<I, M, &'a S> for ValidationTask
where
  I: IntoIterator<Item = Result<LabeledImage, E>>,
  E: std::error::Error + Send + Sync + 'static,
  ME: std::error::Error + Send + Sync + 'static,
  M: Model<Input = Tile, Output = Array2<f32>, Error = ME> + Sync,
  S: MaskSource,
  S::Error: std::error::Error + Send + Sync + 'static,
{
  /// 验证集上的平均 Dice
  type Output = f64;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, masks: &'a S) -> Result<Self::Output, Self::Error> {
    info!("开始在验证集上评估实验 {}...", self.experiment.name);
    let started = Instant::now();
    let aggregator = Aggregator::new(self.experiment.tile.clone())?;
    let mut scores = MeanDice::default();

    for image in input {
      let image = image?;
      let tiles = cut_image(&image, &self.experiment.tile, self.experiment.channels)?;
      let map = infer_image(
        &aggregator,
        &Augmentation::Identity,
        &image.key,
        image.size(),
        &tiles,
        &model,
        self.experiment.batch_size,
      )?;
      let truth = masks
        .mask(&image.key)
        .with_context(|| format!("读取图像 {} 的真值掩码失败", image.key))?;
      let score = dice(binarize(map.view(), THRESHOLD).view(), truth.view())
        .with_context(|| format!("图像 {} 无法评估", image.key))?;
      scores.push(score);
      debug!("图像 {} 的 Dice 为 {:.4}", image.key, score);

      if self.frame_number.is_some_and(|n| scores.count() >= n) {
        info!("达到指定帧数 {}, 结束评估", scores.count());
        break;
      }
    }
    aggregator.assert_no_pending()?;

    let Some(mean) = scores.mean() else {
      bail!("验证集为空");
    };
    info!(
      "实验 {} 在 {} 张验证图像上的平均 Dice 为 {:.4}, 耗时 {:.2?}",
      self.experiment.name,
      scores.count(),
      mean,
      started.elapsed()
    );
    check_accuracy(mean)
  }
}

/// 按清单记录的精度（或显式权重）集成若干运行
#[derive(Debug, Default)]
pub struct EnsembleTask {
  weights: Option<Vec<f64>>,
}

impl EnsembleTask {
  pub fn with_weights(mut self, weights: Option<Vec<f64>>) -> Self {
    self.weights = weights;
    self
  }

  /// 返回集成结果所在的运行 ID
  pub fn run(self, store: &ProbStore, runs: Vec<String>) -> anyhow::Result<String> {
    info!("开始集成 {} 个运行: {:?}", runs.len(), runs);
    let ensemble = match self.weights {
      Some(weights) => Ensemble::with_weights(store.clone(), runs, weights)?,
      None => Ensemble::new(store.clone(), runs)?,
    };
    Ok(ensemble.run()?)
  }
}

/// 对一个运行的全部概率图阈值化、游程编码并写出提交表
#[derive(Debug, Default)]
pub struct SubmitTask {
  order: ScanOrder,
}

impl SubmitTask {
  pub fn with_order(mut self, order: ScanOrder) -> Self {
    self.order = order;
    self
  }

  /// 返回提交表路径
  pub fn run(self, store: &ProbStore, run: &str) -> anyhow::Result<PathBuf> {
    let started = Instant::now();
    let keys = store.list_keys(run)?;
    info!("运行 {} 中有 {} 张概率图, 开始编码", run, keys.len());

    let masks = keys
      .par_iter()
      .map(|key| -> anyhow::Result<(String, String)> {
        let map = store.load_quantized(run, key)?;
        let rle = encode(binarize_quantized(map.view()).view(), self.order);
        Ok((key.clone(), rle.to_string()))
      })
      .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
    info!("编码完成, 耗时 {:.2?}", started.elapsed());

    let path = store.submission_path(run);
    save_submission(&path, &masks)?;
    Ok(path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Brightness, Constant, ModelError};
  use crate::submit::load_submission;
  use std::collections::HashMap;
  use std::convert::Infallible;

  fn experiment(tta: &[&str]) -> ExperimentConfig {
    ExperimentConfig {
      name: "Brightness_test".to_string(),
      model: None,
      params: Default::default(),
      tile: TileConfig::new(4, 4, 1),
      test_time_aug: tta.iter().map(|s| s.to_string()).collect(),
      batch_size: 2,
      validation_accuracy: Some(0.9),
      channels: 3,
    }
  }

  fn gradient(key: &str) -> Result<LabeledImage, Infallible> {
    let pixels = Array3::from_shape_fn((3, 5, 7), |(_, y, x)| (x + y) as f32 / 10.0);
    Ok(LabeledImage::new(key, pixels))
  }

  #[test]
  fn every_augmentation_restores_the_same_map() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    let task = TileInferenceTask::new(experiment(&["none", "hflip", "vflip", "rot180", "transpose"]));
    let model = Brightness::new(10.0, 0.5);
    let runs = task
      .run_task(vec![gradient("a"), gradient("b")], model, &store)
      .unwrap();
    assert_eq!(runs.len(), 5);

    let expected = store.load_quantized(&runs[0], "a").unwrap();
    assert_eq!(expected.dim(), (5, 7));
    for run in &runs {
      assert_eq!(store.list_keys(run).unwrap(), vec!["a", "b"]);
      assert_eq!(store.load_quantized(run, "a").unwrap(), expected);
    }
    let manifest = store.read_manifest(&runs[2]).unwrap();
    assert_eq!(manifest.members[0].augmentation, "vflip");
    assert_eq!(manifest.accuracy, 0.9);
  }

  #[test]
  fn frame_limit_and_empty_input() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    let model = Constant::new(0.75).unwrap();
    let runs = TileInferenceTask::new(experiment(&["none"]))
      .with_frame_number(Some(1))
      .run_task(vec![gradient("a"), gradient("b")], model, &store)
      .unwrap();
    assert_eq!(store.list_keys(&runs[0]).unwrap(), vec!["a"]);

    let empty: Vec<Result<LabeledImage, Infallible>> = Vec::new();
    assert!(
      TileInferenceTask::new(experiment(&["none"]))
        .run_task(empty, model, &store)
        .is_err()
    );
  }

  #[test]
  fn interrupt_stops_between_images() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    let flag = Arc::new(AtomicBool::new(true));
    let runs = TileInferenceTask::new(experiment(&["none"]))
      .with_interrupt(flag)
      .run_task(
        vec![gradient("a"), gradient("b")],
        Constant::new(0.1).unwrap(),
        &store,
      )
      .unwrap();
    assert_eq!(store.list_keys(&runs[0]).unwrap(), vec!["a"]);
    assert!(store.read_manifest(&runs[0]).is_ok());
  }

  #[test]
  fn images_of_different_sizes_in_one_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    let square = Array3::from_shape_fn((3, 6, 6), |(_, y, _)| y as f32 / 6.0);
    let images = vec![
      gradient("a"),
      Ok(LabeledImage::new("b", square)),
      gradient("c"),
    ];
    let runs = TileInferenceTask::new(experiment(&["none", "hflip"]))
      .run_task(images, Brightness::new(10.0, 0.5), &store)
      .unwrap();

    for run in &runs {
      assert_eq!(store.list_keys(run).unwrap(), vec!["a", "b", "c"]);
      assert_eq!(store.load_quantized(run, "a").unwrap().dim(), (5, 7));
      assert_eq!(store.load_quantized(run, "b").unwrap().dim(), (6, 6));
    }
    assert_eq!(
      store.load_quantized(&runs[0], "b").unwrap(),
      store.load_quantized(&runs[1], "b").unwrap()
    );
  }

  #[test]
  fn accuracy_comes_from_task_or_config() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    let model = Constant::new(0.5).unwrap();

    let runs = TileInferenceTask::new(experiment(&["none"]))
      .with_accuracy(Some(0.42))
      .run_task(vec![gradient("a")], model, &store)
      .unwrap();
    assert_eq!(store.read_manifest(&runs[0]).unwrap().accuracy, 0.42);

    let mut unmeasured = experiment(&["none"]);
    unmeasured.validation_accuracy = None;
    assert!(
      TileInferenceTask::new(unmeasured.clone())
        .run_task(vec![gradient("a")], model, &store)
        .is_err()
    );
    assert!(
      TileInferenceTask::new(unmeasured)
        .with_accuracy(Some(1.5))
        .run_task(vec![gradient("a")], model, &store)
        .is_err()
    );
  }

  fn block(height: usize, width: usize, rows: (usize, usize), cols: (usize, usize)) -> Array2<u8> {
    Array2::from_shape_fn((height, width), |(y, x)| {
      u8::from((rows.0..rows.1).contains(&y) && (cols.0..cols.1).contains(&x))
    })
  }

  fn lit(key: &str, mask: &Array2<u8>) -> Result<LabeledImage, Infallible> {
    let (height, width) = mask.dim();
    let pixels = Array3::from_shape_fn((3, height, width), |(_, y, x)| f32::from(mask[(y, x)]));
    Ok(LabeledImage::new(key, pixels))
  }

  #[test]
  fn validation_measures_mean_dice_against_masks() {
    let car = block(5, 7, (1, 3), (2, 5));
    let bus = block(6, 6, (0, 2), (0, 2));
    let masks = HashMap::from([("car".to_string(), car.clone()), ("bus".to_string(), bus)]);

    // car 完全一致；bus 的预测右移一列，4 个像素中重叠 2 个
    let images = vec![lit("car", &car), lit("bus", &block(6, 6, (0, 2), (1, 3)))];
    let accuracy = ValidationTask::new(experiment(&["none"]))
      .run_task(images, Brightness::new(10.0, 0.5), &masks)
      .unwrap();
    assert_eq!(accuracy, 0.75);

    let unknown = vec![lit("truck", &car)];
    assert!(
      ValidationTask::new(experiment(&["none"]))
        .run_task(unknown, Brightness::new(10.0, 0.5), &masks)
        .is_err()
    );
    let empty: Vec<Result<LabeledImage, Infallible>> = Vec::new();
    assert!(
      ValidationTask::new(experiment(&["none"]))
        .run_task(empty, Brightness::new(10.0, 0.5), &masks)
        .is_err()
    );
  }

  struct Broken;

  impl Model for Broken {
    type Input = Tile;
    type Output = Array2<f32>;
    type Error = ModelError;

    fn infer(&self, input: &Tile) -> Result<Array2<f32>, ModelError> {
      let (_, height, width) = input.dim();
      Ok(Array2::zeros((height - 1, width)))
    }
  }

  #[test]
  fn wrong_prediction_shape_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    assert!(
      TileInferenceTask::new(experiment(&["none"]))
        .run_task(vec![gradient("a")], Broken, &store)
        .is_err()
    );
  }

  #[test]
  fn submit_writes_thresholded_masks() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProbStore::new(dir.path());
    store
      .save_map("run", "car_01", ndarray::arr2(&[[0.0f32, 0.9, 0.9], [0.0, 0.0, 0.0], [0.6, 0.5, 0.0]]).view())
      .unwrap();
    store.save_map("run", "car_02", Array2::zeros((3, 3)).view()).unwrap();

    let path = SubmitTask::default().run(&store, "run").unwrap();
    assert_eq!(path, store.submission_path("run"));
    let masks = load_submission(&path).unwrap();
    assert_eq!(masks["car_01"], "2 2 7 1");
    assert_eq!(masks["car_02"], "");
  }
}
