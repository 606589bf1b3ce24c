// 该文件是 Pintu （拼图） 项目的一部分。
// src/input/read_image_file.rs - 从目录读取图像文件
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

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, ImageReader, RgbImage};
use ndarray::{Array2, Array3};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::LabeledImage;
use crate::eval::MaskSource;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ImageDirInputError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{found}'")]
  SchemeMismatch { expected: String, found: String },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像 {path} 加载失败: {source}")]
  ImageLoadError {
    path: PathBuf,
    source: image::ImageError,
  },
}

const DEFAULT_EXTENSION: &str = "jpg";
const DEFAULT_MASK_EXTENSION: &str = "gif";
const DEFAULT_MASK_SUFFIX: &str = "_mask";
/// 灰度严格大于该值的像素为前景
const MASK_LEVEL: u8 = 127;

fn check_scheme(url: &Url, scheme: &str) -> Result<(), ImageDirInputError> {
  if url.scheme() != scheme {
    error!("URI 方案不匹配: 期望 '{}', 实际 '{}'", scheme, url.scheme());
    return Err(ImageDirInputError::SchemeMismatch {
      expected: scheme.to_string(),
      found: url.scheme().to_string(),
    });
  }
  Ok(())
}

fn query(url: &Url, name: &str, default: &str) -> String {
  url
    .query_pairs()
    .find(|(k, _)| k == name)
    .map(|(_, v)| v.into_owned())
    .unwrap_or_else(|| default.to_string())
}

/// `images:///path/to/dir?ext=jpg`，按文件名排序逐张解码
#[derive(Debug, Clone)]
pub struct ImageDirInput {
  dir: PathBuf,
  files: Vec<(String, PathBuf)>,
}

impl FromUrlWithScheme for ImageDirInput {
  const SCHEME: &'static str = "images";
}

impl FromUrl for ImageDirInput {
  type Error = ImageDirInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;
    Self::open(url.path(), &query(url, "ext", DEFAULT_EXTENSION))
  }
}

impl ImageDirInput {
  pub fn open(dir: impl Into<PathBuf>, extension: &str) -> Result<Self, ImageDirInputError> {
    let dir = dir.into();
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir)? {
      let path = entry?.path();
      let matches = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension));
      if !path.is_file() || !matches {
        continue;
      }
      if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
        files.push((stem.to_string(), path.clone()));
      }
    }
    files.sort();
    info!("目录 {} 中共有 {} 张 .{} 图像", dir.display(), files.len(), extension);
    Ok(Self { dir, files })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.files.iter().map(|(key, _)| key.as_str())
  }
}

impl IntoIterator for ImageDirInput {
  type Item = Result<LabeledImage, ImageDirInputError>;
  type IntoIter = ImageDirIter;

  fn into_iter(self) -> Self::IntoIter {
    ImageDirIter {
      files: self.files.into_iter(),
    }
  }
}

pub struct ImageDirIter {
  files: std::vec::IntoIter<(String, PathBuf)>,
}

impl Iterator for ImageDirIter {
  type Item = Result<LabeledImage, ImageDirInputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let (key, path) = self.files.next()?;
    Some(load(&path).map(|pixels| LabeledImage::new(key, pixels)))
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    self.files.size_hint()
  }
}

fn load(path: &Path) -> Result<Array3<f32>, ImageDirInputError> {
  let decoded = ImageReader::open(path)?
    .decode()
    .map_err(|source| ImageDirInputError::ImageLoadError {
      path: path.to_path_buf(),
      source,
    })?;
  let pixels = rgb_to_chw(&decoded.into_rgb8());
  debug!("读取图像 {}: {:?}", path.display(), pixels.dim());
  Ok(pixels)
}

/// `masks:///path/to/dir?ext=gif&suffix=_mask`，图像 `key` 的真值掩码为 `{key}{suffix}.{ext}`
#[derive(Debug, Clone)]
pub struct MaskDir {
  dir: PathBuf,
  extension: String,
  suffix: String,
}

impl FromUrlWithScheme for MaskDir {
  const SCHEME: &'static str = "masks";
}

impl FromUrl for MaskDir {
  type Error = ImageDirInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;
    Ok(Self::new(
      url.path(),
      &query(url, "ext", DEFAULT_MASK_EXTENSION),
      &query(url, "suffix", DEFAULT_MASK_SUFFIX),
    ))
  }
}

impl MaskDir {
  pub fn new(dir: impl Into<PathBuf>, extension: &str, suffix: &str) -> Self {
    Self {
      dir: dir.into(),
      extension: extension.to_string(),
      suffix: suffix.to_string(),
    }
  }

  pub fn path(&self, key: &str) -> PathBuf {
    self
      .dir
      .join(format!("{}{}.{}", key, self.suffix, self.extension))
  }
}

impl MaskSource for MaskDir {
  type Error = ImageDirInputError;

  fn mask(&self, key: &str) -> Result<Array2<u8>, ImageDirInputError> {
    let path = self.path(key);
    let decoded = ImageReader::open(&path)?
      .decode()
      .map_err(|source| ImageDirInputError::ImageLoadError {
        path: path.clone(),
        source,
      })?;
    Ok(gray_to_mask(&decoded.into_luma8()))
  }
}

/// 灰度图 -> (H, W) 的 0/1 掩码
pub fn gray_to_mask(image: &GrayImage) -> Array2<u8> {
  let (width, height) = image.dimensions();
  Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
    u8::from(image.get_pixel(x as u32, y as u32)[0] > MASK_LEVEL)
  })
}

/// RGB 图像 -> (3, H, W)，取值缩放到 [0, 1]
pub fn rgb_to_chw(image: &RgbImage) -> Array3<f32> {
  let (width, height) = image.dimensions();
  Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
    image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
  })
}
