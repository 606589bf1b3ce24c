// 该文件是 Pintu （拼图） 项目的一部分。
// tests/pipeline.rs - 推理、集成与提交的端到端测试
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

mod common;

use std::convert::Infallible;

use common::{brightness_experiment, mask_to_pixels, rectangle_mask};
use pintu::ensemble::{Ensemble, EnsembleError};
use pintu::input::LabeledImage;
use pintu::model::ModelRegistry;
use pintu::rle::{ScanOrder, decode, encode};
use pintu::store::ProbStore;
use pintu::submit::load_submission;
use pintu::task::{EnsembleTask, SubmitTask, Task, TileInferenceTask};
use pintu::tile::{PadMode, TileConfig};

const HEIGHT: usize = 20;
const WIDTH: usize = 30;

fn cars() -> Vec<(String, ndarray::Array2<u8>)> {
  vec![
    ("0cdf5b5d0ce1_01".to_string(), rectangle_mask(HEIGHT, WIDTH, (3, 11), (5, 22))),
    ("0cdf5b5d0ce1_02".to_string(), rectangle_mask(HEIGHT, WIDTH, (0, 20), (29, 30))),
    ("11acc40dc0ea_01".to_string(), rectangle_mask(HEIGHT, WIDTH, (0, 0), (0, 0))),
  ]
}

fn images() -> Vec<Result<LabeledImage, Infallible>> {
  cars()
    .into_iter()
    .map(|(key, mask)| Ok(LabeledImage::new(key, mask_to_pixels(&mask))))
    .collect()
}

#[test]
fn tiles_ensemble_and_submission_reproduce_the_masks() {
  let dir = tempfile::tempdir().unwrap();
  let store = ProbStore::new(dir.path());
  let registry = ModelRegistry::default();

  let first = brightness_experiment(
    "Brightness_tile8",
    TileConfig::new(8, 8, 2),
    &["none", "hflip", "rot180"],
    0.99,
  );
  let second = brightness_experiment(
    "Brightness_tile12",
    TileConfig::new(12, 12, 3).with_pad_mode(PadMode::Reflect),
    &["transpose", "shift:1:-2"],
    0.97,
  );

  let mut runs = Vec::new();
  for experiment in [first, second] {
    let model = registry
      .build_for_experiment(&experiment.name, &experiment.params)
      .unwrap();
    runs.extend(
      TileInferenceTask::new(experiment)
        .run_task(images(), model, &store)
        .unwrap(),
    );
  }
  assert_eq!(runs.len(), 5);

  let ensemble = Ensemble::new(store.clone(), runs.clone()).unwrap();
  let total: f64 = ensemble.weights().iter().sum();
  assert!((total - 1.0).abs() < 1e-12);
  assert!(ensemble.weights()[0] > ensemble.weights()[4]);

  let combined = EnsembleTask::default().run(&store, runs.clone()).unwrap();
  let manifest = store.read_manifest(&combined).unwrap();
  assert_eq!(manifest.constituents, runs);
  assert_eq!(manifest.members.len(), 5);
  assert_eq!(manifest.members[3].augmentation, "transpose");
  assert_eq!(manifest.members[4].experiment, "Brightness_tile12");

  let path = SubmitTask::default().run(&store, &combined).unwrap();
  let submission = load_submission(&path).unwrap();
  assert_eq!(submission.len(), 3);
  for (key, mask) in cars() {
    let expected = encode(mask.view(), ScanOrder::RowMajor).to_string();
    assert_eq!(submission[&key], expected, "{}", key);
    assert_eq!(
      decode(&submission[&key], (HEIGHT, WIDTH), ScanOrder::RowMajor).unwrap(),
      mask
    );
  }
  assert_eq!(submission["11acc40dc0ea_01"], "");
}

#[test]
fn ensemble_refuses_runs_with_missing_maps() {
  let dir = tempfile::tempdir().unwrap();
  let store = ProbStore::new(dir.path());
  let registry = ModelRegistry::default();
  let experiment = brightness_experiment("Brightness_a", TileConfig::new(8, 8, 2), &["none"], 0.9);

  let model = registry.build(experiment.model_id(), &experiment.params).unwrap();
  let full = TileInferenceTask::new(experiment.clone())
    .run_task(images(), model, &store)
    .unwrap();
  let model = registry.build(experiment.model_id(), &experiment.params).unwrap();
  let partial = TileInferenceTask::new(experiment)
    .with_frame_number(Some(1))
    .run_task(images(), model, &store)
    .unwrap();

  let result = EnsembleTask::default().run(&store, vec![full[0].clone(), partial[0].clone()]);
  let error = result.unwrap_err();
  assert!(matches!(
    error.downcast_ref::<EnsembleError>(),
    Some(EnsembleError::MissingRunError { run, .. }) if *run == partial[0]
  ));
}

#[cfg(feature = "read_image_file")]
#[test]
fn images_are_read_from_a_directory() {
  use pintu::FromUrl;
  use pintu::input::ImageDirInput;

  let images_dir = tempfile::tempdir().unwrap();
  for (key, mask) in cars() {
    let image = image::RgbImage::from_fn(WIDTH as u32, HEIGHT as u32, |x, y| {
      let value = mask[(y as usize, x as usize)] * 255;
      image::Rgb([value, value, value])
    });
    image.save(images_dir.path().join(format!("{}.png", key))).unwrap();
  }

  let store_dir = tempfile::tempdir().unwrap();
  let url = url::Url::parse(&format!("probs://{}", store_dir.path().display())).unwrap();
  let store = ProbStore::from_url(&url).unwrap();
  let input = ImageDirInput::open(images_dir.path(), "png").unwrap();
  assert_eq!(input.len(), 3);

  let experiment = brightness_experiment("Brightness_png", TileConfig::new(16, 16, 4), &["vflip"], 0.9);
  let model = ModelRegistry::default()
    .build_for_experiment(&experiment.name, &experiment.params)
    .unwrap();
  let runs = TileInferenceTask::new(experiment)
    .run_task(input, model, &store)
    .unwrap();

  let path = SubmitTask::default().run(&store, &runs[0]).unwrap();
  let submission = load_submission(&path).unwrap();
  for (key, mask) in cars() {
    assert_eq!(submission[&key], encode(mask.view(), ScanOrder::RowMajor).to_string());
  }
}

#[cfg(feature = "read_image_file")]
#[test]
fn accuracy_is_measured_on_validation_masks_and_recorded() {
  use pintu::input::{ImageDirInput, MaskDir};
  use pintu::task::ValidationTask;

  let images_dir = tempfile::tempdir().unwrap();
  let masks_dir = tempfile::tempdir().unwrap();
  for (key, mask) in cars() {
    let gray = image::GrayImage::from_fn(WIDTH as u32, HEIGHT as u32, |x, y| {
      image::Luma([mask[(y as usize, x as usize)] * 255])
    });
    gray.save(masks_dir.path().join(format!("{}_mask.png", key))).unwrap();
    image::DynamicImage::ImageLuma8(gray)
      .into_rgb8()
      .save(images_dir.path().join(format!("{}.png", key)))
      .unwrap();
  }

  let mut experiment = brightness_experiment("Brightness_val", TileConfig::new(8, 8, 2), &["none"], 0.0);
  experiment.validation_accuracy = None;
  let registry = ModelRegistry::default();
  let model = registry.build(experiment.model_id(), &experiment.params).unwrap();

  let masks = MaskDir::new(masks_dir.path(), "png", "_mask");
  let accuracy = ValidationTask::new(experiment.clone())
    .run_task(ImageDirInput::open(images_dir.path(), "png").unwrap(), &model, &masks)
    .unwrap();
  assert_eq!(accuracy, 1.0);

  let store_dir = tempfile::tempdir().unwrap();
  let store = ProbStore::new(store_dir.path());
  let runs = TileInferenceTask::new(experiment)
    .with_accuracy(Some(accuracy))
    .run_task(images(), &model, &store)
    .unwrap();
  assert_eq!(store.read_manifest(&runs[0]).unwrap().accuracy, 1.0);
}
