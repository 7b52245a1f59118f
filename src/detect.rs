// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/detect.rs - 单帧检测调用
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

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{BoxDecoder, ImagePipeline, Network};
use crate::buffer::{BufferError, FrameBuffers};
use crate::labels::{LabelError, LabelLoader, LabelSlot};
use crate::session::Session;

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("图像解码失败: {0}")]
  ImageDecode(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("缓冲区错误: {0}")]
  Buffer(#[from] BufferError),
  #[error("标签加载失败: {0}")]
  Label(#[from] LabelError),
  #[error("前向传播失败: {0}")]
  Inference(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("检测输出解码失败: {0}")]
  OutputDecode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// 一条检测命中：候选框下标、类别与得分。同一候选框可因多个
/// 类别超过阈值产生多条记录，互不去重。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub cell: usize,
  pub class_id: usize,
  pub score: f32,
}

/// 检测调用选项。概率比较为严格大于 `threshold`；
/// `hier_threshold` 传递给框解码器，只对层级类别树生效。
#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
  pub threshold: f32,
  pub hier_threshold: f32,
}

impl Default for DetectOptions {
  fn default() -> Self {
    Self {
      threshold: 0.24,
      hier_threshold: 0.5,
    }
  }
}

/// 从概率缓冲区收集严格超过阈值的命中记录。
pub fn collect_hits(probs: &[Box<[f32]>], classes: usize, threshold: f32) -> Box<[Detection]> {
  let mut hits = Vec::new();
  for (cell, row) in probs.iter().enumerate() {
    for class_id in 0..classes {
      if row[class_id] > threshold {
        hits.push(Detection {
          cell,
          class_id,
          score: row[class_id],
        });
      }
    }
  }
  hits.into_boxed_slice()
}

impl<N: Network> Session<N> {
  /// 对一帧编码图像执行一次同步检测。
  ///
  /// 流程：解码并信箱缩放到网络输入尺寸（使用会话线程池）→ 按
  /// boxes → probs → masks → 标签的固定顺序准备缓冲区 → 前向传播 →
  /// 解码检测输出就地写入缓冲区 → 收集严格超过阈值的命中记录。
  ///
  /// `buffers` 遵循复用协议：空槽位由本次调用分配并通过槽位交还，
  /// 非空槽位视为上一次调用的缓冲区并原样复用（几何必须一致）。
  /// 准备阶段之后的任何失败都会把本次调用新分配的槽位回滚为空，
  /// 调用方带入的槽位绝不释放；中间像素帧无论成败都在返回前释放。
  /// 失败的调用可以安全重试。
  #[allow(clippy::too_many_arguments)]
  pub fn detect<P, D, L>(
    &mut self,
    image: &[u8],
    pipeline: &P,
    decoder: &D,
    label_loader: &L,
    labels: &mut LabelSlot,
    buffers: &mut FrameBuffers,
    options: &DetectOptions,
  ) -> Result<Box<[Detection]>, DetectError>
  where
    P: ImagePipeline,
    D: BoxDecoder,
    L: LabelLoader,
  {
    let shape = self.net.input_shape();

    debug!("解码输入图像, {} 字节", image.len());
    let decoded = pipeline
      .decode_from_memory(image, shape.channels, &self.pool)
      .map_err(|e| DetectError::ImageDecode(Box::new(e)))?;
    debug!("信箱缩放到 {}x{}", shape.width, shape.height);
    let sized = pipeline
      .letterbox(&decoded, shape.width, shape.height, &self.pool)
      .map_err(|e| DetectError::ImageDecode(Box::new(e)))?;

    let geometry = self.net.detection_geometry();
    let provenance = buffers.prepare(&geometry, &mut self.alloc)?;

    let outcome = (|| -> Result<Box<[Detection]>, DetectError> {
      labels.ensure(label_loader, &self.names, geometry.classes)?;

      debug!("执行前向传播");
      let raw = self
        .net
        .forward(&sized, &self.pool)
        .map_err(|e| DetectError::Inference(Box::new(e)))?;

      debug!("解码检测输出");
      let view = buffers.filled_view().ok_or(BufferError::Incomplete)?;
      decoder
        .decode_boxes(
          &geometry,
          (decoded.width(), decoded.height()),
          (shape.width, shape.height),
          options.threshold,
          options.hier_threshold,
          &raw,
          view,
        )
        .map_err(|e| DetectError::OutputDecode(Box::new(e)))?;

      let probs = buffers.probs().ok_or(BufferError::Incomplete)?;
      Ok(collect_hits(probs, geometry.classes, options.threshold))
    })();

    match outcome {
      Ok(hits) => {
        info!("检测完成, 命中 {} 条", hits.len());
        Ok(hits)
      }
      Err(e) => {
        buffers.rollback(&provenance);
        Err(e)
      }
    }
    // 中间像素帧 decoded / sized 随作用域结束释放
  }
}
