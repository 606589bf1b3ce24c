// 该文件是 Pintu （拼图） 项目的一部分。
// src/store/manifest.rs - 运行与集成清单
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

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 一次推理运行的来源：哪个实验的模型、哪种测试时增强
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMember {
  pub experiment: String,
  pub augmentation: String,
  pub accuracy: f64,
}

/// `{run}/manifest.json`
///
/// 单次推理运行只有一个成员；集成运行记录组成它的运行 ID、
/// 与之顺序对齐的权重，以及展开后的全部成员。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
  pub created_at: String,
  /// 该运行记录的验证精度，集成权重由它导出
  pub accuracy: f64,
  pub members: Vec<RunMember>,
  #[serde(default)]
  pub constituents: Vec<String>,
  #[serde(default)]
  pub weights: Vec<f64>,
}

impl RunManifest {
  pub fn single(member: RunMember) -> Self {
    Self {
      created_at: Utc::now().to_rfc3339(),
      accuracy: member.accuracy,
      members: vec![member],
      constituents: Vec::new(),
      weights: Vec::new(),
    }
  }

  /// 集成的精度记为各组成运行精度的加权平均
  pub fn ensemble(
    constituents: Vec<(String, RunManifest)>,
    weights: Vec<f64>,
  ) -> Self {
    let accuracy = constituents
      .iter()
      .zip(&weights)
      .map(|((_, manifest), weight)| manifest.accuracy * weight)
      .sum();
    let members = constituents
      .iter()
      .flat_map(|(_, manifest)| manifest.members.iter().cloned())
      .collect();

    Self {
      created_at: Utc::now().to_rfc3339(),
      accuracy,
      members,
      constituents: constituents.into_iter().map(|(run, _)| run).collect(),
      weights,
    }
  }

  pub fn is_ensemble(&self) -> bool {
    !self.constituents.is_empty()
  }
}
