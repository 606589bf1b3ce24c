// 该文件是 Pintu （拼图） 项目的一部分。
// src/store.rs - 概率图持久化
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

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use ndarray::{Array2, ArrayView2};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, ProbabilityMap};

pub mod manifest;

pub use self::manifest::{RunManifest, RunMember};

const PROBS_DIR_NAME: &str = "probs";
const MANIFEST_FILE_NAME: &str = "manifest.json";
const SUBMISSION_FILE_NAME: &str = "submission.csv";
const MAP_EXTENSION: &str = "npy";

/// 概率以百分比存储
pub const QUANTIZE_SCALE: f32 = 100.0;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] io::Error),
  #[error("概率图格式错误 {path}: {reason}")]
  FormatError { path: PathBuf, reason: String },
  #[error("运行 {run} 缺少图像 {key} 的概率图")]
  MissingMap { run: String, key: String },
  #[error("运行 {0} 缺少清单")]
  MissingManifest(String),
  #[error("清单解析错误: {0}")]
  ManifestError(#[from] serde_json::Error),
}

/// 概率 -> int8 百分比：先截断到 [0, 100]，再向零取整
pub fn quantize(probability: f32) -> i8 {
  (probability * QUANTIZE_SCALE).clamp(0.0, QUANTIZE_SCALE) as i8
}

pub fn dequantize(value: i8) -> f32 {
  value as f32 / QUANTIZE_SCALE
}

pub fn quantize_map(map: ArrayView2<'_, f32>) -> Array2<i8> {
  map.mapv(quantize)
}

pub fn dequantize_map(map: ArrayView2<'_, i8>) -> ProbabilityMap {
  map.mapv(dequantize)
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 先写入同目录下的临时文件，再重命名到目标路径，读者不会看到写了一半的文件
pub fn write_atomically<F>(path: &Path, write: F) -> io::Result<()>
where
  F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
  let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
  if let Some(parent) = parent {
    fs::create_dir_all(parent)?;
  }

  let file_name = path
    .file_name()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "目标路径缺少文件名"))?
    .to_string_lossy();
  let temp = path.with_file_name(format!(
    ".{}.{}-{}.tmp",
    file_name,
    std::process::id(),
    TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
  ));

  let result = (|| -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(&temp)?);
    write(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
  })();
  if let Err(e) = result {
    let _ = fs::remove_file(&temp);
    return Err(e);
  }

  if path.exists() {
    warn!("{} 已存在, 将被覆盖", path.display());
  }
  fs::rename(&temp, path)
}

/// 以运行 ID 分目录保存概率图：`{root}/{run}/probs/{key}.npy`
///
/// 概率图放在运行目录下的 `probs/` 子目录，与 `manifest.json`、`submission.csv` 分开；
/// 每张图是 int8 百分比的二维 NumPy 数组。
#[derive(Debug, Clone)]
pub struct ProbStore {
  root: PathBuf,
}

impl FromUrlWithScheme for ProbStore {
  const SCHEME: &'static str = "probs";
}

impl FromUrl for ProbStore {
  type Error = StoreError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(StoreError::SchemeMismatch(format!(
        "期望存储方式 '{}', 实际存储方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    Ok(Self::new(url.path()))
  }
}

impl ProbStore {
  pub fn new<P: Into<PathBuf>>(root: P) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn run_dir(&self, run: &str) -> PathBuf {
    self.root.join(run)
  }

  pub fn map_path(&self, run: &str, key: &str) -> PathBuf {
    self
      .run_dir(run)
      .join(PROBS_DIR_NAME)
      .join(format!("{}.{}", key, MAP_EXTENSION))
  }

  pub fn submission_path(&self, run: &str) -> PathBuf {
    self.run_dir(run).join(SUBMISSION_FILE_NAME)
  }

  fn manifest_path(&self, run: &str) -> PathBuf {
    self.run_dir(run).join(MANIFEST_FILE_NAME)
  }

  /// 以当前时间创建新的运行目录，重名时追加序号
  pub fn create_run(&self) -> Result<String, StoreError> {
    fs::create_dir_all(&self.root)?;
    let stamp = Local::now().format("%m%d-%H%M%S").to_string();
    let mut suffix = 0usize;
    loop {
      let run = if suffix == 0 {
        stamp.clone()
      } else {
        format!("{}-{}", stamp, suffix)
      };
      match fs::create_dir(self.run_dir(&run)) {
        Ok(()) => {
          info!("创建运行目录: {}", self.run_dir(&run).display());
          return Ok(run);
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
        Err(e) => return Err(e.into()),
      }
    }
  }

  pub fn save_map(&self, run: &str, key: &str, map: ArrayView2<'_, f32>) -> Result<(), StoreError> {
    self.save_quantized(run, key, quantize_map(map).view())
  }

  pub fn save_quantized(&self, run: &str, key: &str, map: ArrayView2<'_, i8>) -> Result<(), StoreError> {
    let path = self.map_path(run, key);
    write_atomically(&path, |writer| map.write_npy(writer).map_err(io::Error::other))?;
    debug!("保存概率图: {}", path.display());
    Ok(())
  }

  pub fn has_map(&self, run: &str, key: &str) -> bool {
    self.map_path(run, key).is_file()
  }

  /// 读取失败会原样返回，缺失的图不会被当成全零
  pub fn load_quantized(&self, run: &str, key: &str) -> Result<Array2<i8>, StoreError> {
    let path = self.map_path(run, key);
    let file = match File::open(&path) {
      Ok(file) => file,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(StoreError::MissingMap {
          run: run.to_string(),
          key: key.to_string(),
        });
      }
      Err(e) => return Err(e.into()),
    };
    Array2::<i8>::read_npy(BufReader::new(file)).map_err(|e| StoreError::FormatError {
      path,
      reason: e.to_string(),
    })
  }

  pub fn load_map(&self, run: &str, key: &str) -> Result<ProbabilityMap, StoreError> {
    Ok(dequantize_map(self.load_quantized(run, key)?.view()))
  }

  /// 某次运行中已保存的全部图像名，按字典序排列
  pub fn list_keys(&self, run: &str) -> Result<Vec<String>, StoreError> {
    let dir = self.run_dir(run).join(PROBS_DIR_NAME);
    let mut keys = Vec::new();
    for entry in fs::read_dir(&dir)? {
      let path = entry?.path();
      if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(MAP_EXTENSION) {
        continue;
      }
      if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        && !stem.starts_with('.')
      {
        keys.push(stem.to_string());
      }
    }
    keys.sort();
    Ok(keys)
  }

  pub fn write_manifest(&self, run: &str, manifest: &RunManifest) -> Result<(), StoreError> {
    let path = self.manifest_path(run);
    write_atomically(&path, |writer| {
      serde_json::to_writer_pretty(&mut *writer, manifest).map_err(io::Error::other)
    })?;
    info!("写入清单: {}", path.display());
    Ok(())
  }

  pub fn read_manifest(&self, run: &str) -> Result<RunManifest, StoreError> {
    let path = self.manifest_path(run);
    let file = match File::open(&path) {
      Ok(file) => file,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(StoreError::MissingManifest(run.to_string()));
      }
      Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_reader(BufReader::new(file))?)
  }
}
