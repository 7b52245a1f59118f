// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/backend.rs - 推理后端与协作方接口
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

use crate::buffer::FrameView;
use crate::frame::PixelFrame;

/// 网络输入形状。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
  pub width: usize,
  pub height: usize,
  pub channels: usize,
}

/// 最终检测层的几何参数。候选框总数 `N = width * height * boxes_per_cell`，
/// 每个候选框携带 `coords` 个坐标（前 4 个是框，其余为掩码坐标）、
/// 1 个目标置信度与 `classes` 个类别得分。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerGeometry {
  pub width: usize,
  pub height: usize,
  pub boxes_per_cell: usize,
  pub classes: usize,
  pub coords: usize,
}

impl LayerGeometry {
  pub fn cell_count(&self) -> usize {
    self.width * self.height * self.boxes_per_cell
  }

  pub fn prob_len(&self) -> usize {
    self.classes + 1
  }

  pub fn has_masks(&self) -> bool {
    self.coords > 4
  }

  pub fn mask_len(&self) -> usize {
    self.coords.saturating_sub(4)
  }

  /// 单个候选框在原始输出中的条目长度。
  pub fn entry_len(&self) -> usize {
    self.coords + 1 + self.classes
  }

  /// 整个检测层原始输出的长度。
  pub fn output_len(&self) -> usize {
    self.cell_count() * self.entry_len()
  }
}

/// 一次前向传播的原始网络输出。
#[derive(Debug, Clone)]
pub struct RawOutput {
  pub data: Box<[f32]>,
}

/// 已加载的网络：前向传播引擎。
pub trait Network {
  type Error: std::error::Error + Send + Sync + 'static;

  fn input_shape(&self) -> InputShape;
  fn detection_geometry(&self) -> LayerGeometry;
  fn forward(
    &mut self,
    frame: &PixelFrame,
    pool: &rayon::ThreadPool,
  ) -> Result<RawOutput, Self::Error>;
}

/// 模型加载器：从网络结构与权重文件构造 [`Network`]。
pub trait NetworkLoader {
  type Network: Network;
  type Error: std::error::Error + Send + Sync + 'static;

  fn load(&self, config: &Path, weights: &Path) -> Result<Self::Network, Self::Error>;
}

/// 图像管线：解码内存中的图像字节并信箱缩放到网络输入尺寸。
/// 逐行/逐平面的工作在会话的工作线程池上执行。
pub trait ImagePipeline {
  type Error: std::error::Error + Send + Sync + 'static;

  fn decode_from_memory(
    &self,
    bytes: &[u8],
    channels: usize,
    pool: &rayon::ThreadPool,
  ) -> Result<PixelFrame, Self::Error>;

  fn letterbox(
    &self,
    frame: &PixelFrame,
    width: usize,
    height: usize,
    pool: &rayon::ThreadPool,
  ) -> Result<PixelFrame, Self::Error>;
}

/// 框解码器：把原始网络输出解码进已准备好的缓冲区视图。
pub trait BoxDecoder {
  type Error: std::error::Error + Send + Sync + 'static;

  #[allow(clippy::too_many_arguments)]
  fn decode_boxes(
    &self,
    geometry: &LayerGeometry,
    image_size: (usize, usize),
    net_size: (usize, usize),
    threshold: f32,
    hier_threshold: f32,
    raw: &RawOutput,
    view: FrameView<'_>,
  ) -> Result<(), Self::Error>;
}

#[cfg(feature = "replay_backend")]
mod replay;
#[cfg(feature = "replay_backend")]
pub use self::replay::{ReplayError, ReplayLoader, ReplayNetwork};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn geometry_derived_sizes() {
    let geometry = LayerGeometry {
      width: 13,
      height: 13,
      boxes_per_cell: 5,
      classes: 20,
      coords: 4,
    };

    assert_eq!(geometry.cell_count(), 845);
    assert_eq!(geometry.prob_len(), 21);
    assert!(!geometry.has_masks());
    assert_eq!(geometry.mask_len(), 0);
    assert_eq!(geometry.entry_len(), 25);
    assert_eq!(geometry.output_len(), 845 * 25);
  }

  #[test]
  fn masks_follow_coords() {
    let geometry = LayerGeometry {
      width: 2,
      height: 2,
      boxes_per_cell: 3,
      classes: 5,
      coords: 8,
    };

    assert!(geometry.has_masks());
    assert_eq!(geometry.mask_len(), 4);
  }
}
