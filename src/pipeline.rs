// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/pipeline.rs - 图像解码与信箱缩放管线
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

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::backend::ImagePipeline;
use crate::frame::PixelFrame;

const PAD_VALUE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("图像解码失败: {0}")]
  Decode(#[from] image::ImageError),
  #[error("不支持的通道数: {0}")]
  Channels(usize),
}

/// 基于 image 库的参考管线：内存解码为 CHW 浮点帧，
/// 信箱缩放保持纵横比并以灰色填充。逐平面/逐行的工作
/// 在会话的工作线程池上并行执行。
#[derive(Debug, Default, Clone, Copy)]
pub struct CodecPipeline;

impl ImagePipeline for CodecPipeline {
  type Error = CodecError;

  fn decode_from_memory(
    &self,
    bytes: &[u8],
    channels: usize,
    pool: &rayon::ThreadPool,
  ) -> Result<PixelFrame, CodecError> {
    if channels != 3 {
      return Err(CodecError::Channels(channels));
    }

    let img = image::load_from_memory(bytes)?.to_rgb8();
    let (width, height) = img.dimensions();
    let (width, height) = (width as usize, height as usize);
    debug!("图像解码完成: {}x{}", width, height);

    let raw = img.into_raw();
    let mut frame = PixelFrame::with_shape(width, height, channels);
    let plane = width * height;

    pool.install(|| {
      frame
        .as_mut()
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(channel, out)| {
          for (i, value) in out.iter_mut().enumerate() {
            *value = raw[i * channels + channel] as f32 / 255.0;
          }
        });
    });

    Ok(frame)
  }

  fn letterbox(
    &self,
    frame: &PixelFrame,
    width: usize,
    height: usize,
    pool: &rayon::ThreadPool,
  ) -> Result<PixelFrame, CodecError> {
    // 保持纵横比的内容区尺寸
    let (new_w, new_h) = if width * frame.height() < height * frame.width() {
      (width, frame.height() * width / frame.width())
    } else {
      (frame.width() * height / frame.height(), height)
    };

    let resized = resize_bilinear(frame, new_w, new_h, pool);
    let mut boxed = PixelFrame::filled(width, height, frame.channels(), PAD_VALUE);

    let dx = (width - new_w) / 2;
    let dy = (height - new_h) / 2;
    for channel in 0..frame.channels() {
      for y in 0..new_h {
        for x in 0..new_w {
          boxed.set(channel, y + dy, x + dx, resized.get(channel, y, x));
        }
      }
    }

    debug!(
      "信箱缩放完成: {}x{} -> {}x{} (内容区 {}x{})",
      frame.width(),
      frame.height(),
      width,
      height,
      new_w,
      new_h
    );
    Ok(boxed)
  }
}

fn resize_bilinear(src: &PixelFrame, width: usize, height: usize, pool: &rayon::ThreadPool) -> PixelFrame {
  let w_scale = if width > 1 {
    (src.width() - 1) as f32 / (width - 1) as f32
  } else {
    0.0
  };
  let h_scale = if height > 1 {
    (src.height() - 1) as f32 / (height - 1) as f32
  } else {
    0.0
  };

  let mut out = PixelFrame::with_shape(width, height, src.channels());

  pool.install(|| {
    out
      .as_mut()
      .par_chunks_mut(width)
      .enumerate()
      .for_each(|(index, row)| {
        let channel = index / height;
        let y = index % height;

        let sy = y as f32 * h_scale;
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(src.height() - 1);
        let fy = sy - y0 as f32;

        for (x, value) in row.iter_mut().enumerate() {
          let sx = x as f32 * w_scale;
          let x0 = sx.floor() as usize;
          let x1 = (x0 + 1).min(src.width() - 1);
          let fx = sx - x0 as f32;

          *value = (1.0 - fy) * ((1.0 - fx) * src.get(channel, y0, x0) + fx * src.get(channel, y0, x1))
            + fy * ((1.0 - fx) * src.get(channel, y1, x0) + fx * src.get(channel, y1, x1));
        }
      });
  });

  out
}
