// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/backend/replay.rs - 回放后端
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

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{InputShape, LayerGeometry, Network, NetworkLoader, RawOutput};
use crate::frame::PixelFrame;

const REPLAY_BACKEND_KIND: &str = "replay";

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("模型加载错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型配置无效: {0}")]
  Parse(String),
  #[error("模型要求的后端未编译进当前构建: {0}")]
  Unsupported(String),
  #[error("权重大小与检测层几何不符: 期望 {expected} 个参数, 实际 {found} 个")]
  WeightsMismatch { expected: usize, found: usize },
  #[error("输入帧形状与模型不符: 期望 {expected:?}, 实际 {found:?}")]
  InputMismatch {
    expected: InputShape,
    found: InputShape,
  },
}

/// 回放网络：加载时记录检测层的原始输出张量，
/// 每次前向传播原样回放。用于驱动会话机制的联调与基准测试。
pub struct ReplayNetwork {
  shape: InputShape,
  geometry: LayerGeometry,
  output: Box<[f32]>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayLoader;

impl NetworkLoader for ReplayLoader {
  type Network = ReplayNetwork;
  type Error = ReplayError;

  fn load(&self, config: &Path, weights: &Path) -> Result<ReplayNetwork, ReplayError> {
    info!("加载模型配置: {}", config.display());
    let text = std::fs::read_to_string(config)?;
    let (shape, geometry) = parse_config(&text)?;

    debug!("网络输入形状: {:?}", shape);
    debug!("检测层几何: {:?}", geometry);

    info!("加载权重文件: {}", weights.display());
    let bytes = std::fs::read(weights)?;
    debug!(
      "权重文件大小: {:.2} MB",
      bytes.len() as f64 / (1024.0 * 1024.0)
    );

    if bytes.len() % 4 != 0 {
      return Err(ReplayError::Parse(format!(
        "权重文件长度 {} 不是 4 的倍数",
        bytes.len()
      )));
    }

    let expected = geometry.output_len();
    let found = bytes.len() / 4;
    if found != expected {
      return Err(ReplayError::WeightsMismatch { expected, found });
    }

    let output = bytes
      .chunks_exact(4)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
      .collect::<Vec<_>>()
      .into_boxed_slice();

    info!("模型加载完成");
    Ok(ReplayNetwork {
      shape,
      geometry,
      output,
    })
  }
}

impl Network for ReplayNetwork {
  type Error = ReplayError;

  fn input_shape(&self) -> InputShape {
    self.shape
  }

  fn detection_geometry(&self) -> LayerGeometry {
    self.geometry
  }

  fn forward(
    &mut self,
    frame: &PixelFrame,
    _pool: &rayon::ThreadPool,
  ) -> Result<RawOutput, ReplayError> {
    let found = InputShape {
      width: frame.width(),
      height: frame.height(),
      channels: frame.channels(),
    };
    if found != self.shape {
      return Err(ReplayError::InputMismatch {
        expected: self.shape,
        found,
      });
    }

    debug!("回放检测层输出, 长度 {}", self.output.len());
    Ok(RawOutput {
      data: self.output.clone(),
    })
  }
}

fn parse_config(text: &str) -> Result<(InputShape, LayerGeometry), ReplayError> {
  let mut backend = REPLAY_BACKEND_KIND.to_string();
  let mut values = [None::<usize>; 8];
  const KEYS: [&str; 8] = [
    "width",
    "height",
    "channels",
    "detect_w",
    "detect_h",
    "boxes_per_cell",
    "classes",
    "coords",
  ];

  for line in text.lines() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let (key, value) = line
      .split_once('=')
      .ok_or_else(|| ReplayError::Parse(format!("无法解析的配置行: {line}")))?;
    let (key, value) = (key.trim(), value.trim());

    if key == "backend" {
      backend = value.to_string();
      continue;
    }

    let index = KEYS
      .iter()
      .position(|k| *k == key)
      .ok_or_else(|| ReplayError::Parse(format!("未知配置项: {key}")))?;
    let parsed = value
      .parse::<usize>()
      .map_err(|_| ReplayError::Parse(format!("配置项 {key} 的值无效: {value}")))?;
    if parsed == 0 {
      return Err(ReplayError::Parse(format!("配置项 {key} 不能为 0")));
    }
    values[index] = Some(parsed);
  }

  if backend != REPLAY_BACKEND_KIND {
    return Err(ReplayError::Unsupported(backend));
  }

  let mut resolved = [0usize; 8];
  for (index, key) in KEYS.iter().enumerate() {
    resolved[index] =
      values[index].ok_or_else(|| ReplayError::Parse(format!("缺少配置项: {key}")))?;
  }

  let shape = InputShape {
    width: resolved[0],
    height: resolved[1],
    channels: resolved[2],
  };
  let geometry = LayerGeometry {
    width: resolved[3],
    height: resolved[4],
    boxes_per_cell: resolved[5],
    classes: resolved[6],
    coords: resolved[7],
  };
  Ok((shape, geometry))
}
