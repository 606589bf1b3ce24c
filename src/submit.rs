// 该文件是 Pintu （拼图） 项目的一部分。
// src/submit.rs - 提交表的写入与读取
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
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::time::Instant;

use thiserror::Error;
use tracing::info;

use crate::store::write_atomically;

pub const IMAGE_COLUMN: &str = "img";
pub const MASK_COLUMN: &str = "rle_mask";
pub const IMAGE_SUFFIX: &str = ".jpg";

#[derive(Error, Debug)]
pub enum SubmissionError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] io::Error),
  #[error("表头应为 'img,rle_mask', 实际为 '{0}'")]
  HeaderMismatch(String),
  #[error("第 {line} 行格式错误: {reason}")]
  MalformedRow { line: usize, reason: String },
  #[error("图像名不能包含逗号或换行: {0}")]
  InvalidKey(String),
}

/// 写入 `img,rle_mask` 两列的提交表，`img` 列追加 `.jpg` 后缀
pub fn save_submission(path: &Path, masks: &BTreeMap<String, String>) -> Result<(), SubmissionError> {
  let started = Instant::now();
  if let Some(key) = masks.keys().find(|key| key.contains([',', '\n', '\r'])) {
    return Err(SubmissionError::InvalidKey(key.clone()));
  }

  write_atomically(path, |writer| {
    writeln!(writer, "{},{}", IMAGE_COLUMN, MASK_COLUMN)?;
    for (key, rle) in masks {
      writeln!(writer, "{}{},{}", key, IMAGE_SUFFIX, rle)?;
    }
    Ok(())
  })?;

  info!(
    "{} 条结果已写入 {}, 耗时 {:.2?}",
    masks.len(),
    path.display(),
    started.elapsed()
  );
  Ok(())
}

/// 读取提交表，校验表头并去掉 `img` 列的后缀
pub fn load_submission(path: &Path) -> Result<BTreeMap<String, String>, SubmissionError> {
  let started = Instant::now();
  let reader = BufReader::new(File::open(path)?);
  let mut lines = reader.lines();

  let header = lines.next().transpose()?.unwrap_or_default();
  if header.trim_end() != format!("{},{}", IMAGE_COLUMN, MASK_COLUMN) {
    return Err(SubmissionError::HeaderMismatch(header));
  }

  let mut masks = BTreeMap::new();
  for (index, line) in lines.enumerate() {
    let line = line?;
    let line_number = index + 2;
    let line = line.trim_end();
    if line.is_empty() {
      continue;
    }
    let (image, rle) = line.split_once(',').ok_or_else(|| SubmissionError::MalformedRow {
      line: line_number,
      reason: "缺少逗号分隔符".to_string(),
    })?;
    let key = image.strip_suffix(IMAGE_SUFFIX).unwrap_or(image);
    if masks.insert(key.to_string(), rle.to_string()).is_some() {
      return Err(SubmissionError::MalformedRow {
        line: line_number,
        reason: format!("图像 {} 重复出现", key),
      });
    }
  }

  info!(
    "从 {} 读取 {} 条结果, 耗时 {:.2?}",
    path.display(),
    masks.len(),
    started.elapsed()
  );
  Ok(masks)
}
