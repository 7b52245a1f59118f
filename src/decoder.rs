// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/decoder.rs - 区域检测层解码与非极大值抑制
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
use tracing::debug;

use crate::backend::{BoxDecoder, LayerGeometry, RawOutput};
use crate::buffer::{BoxRecord, FrameView};

#[derive(Error, Debug)]
pub enum RegionDecodeError {
  #[error("原始输出长度与检测层几何不符: 期望 {expected}, 实际 {found}")]
  OutputMismatch { expected: usize, found: usize },
}

/// 区域检测层解码器。
///
/// 候选框条目按 `[coords 个坐标, 目标置信度, classes 个类别得分]` 排布：
/// 前 4 个坐标经 logistic/exp 变换并按锚框缩放得到相对坐标的边界框，
/// 其余坐标原样写入掩码缓冲区；类别概率为目标置信度与类别得分之积，
/// 小于等于阈值的清零，下标 `classes` 处保留该候选框的最大类别概率。
pub struct RegionDecoder {
  /// 锚框宽高，按候选框下标取用；为空时视为 1.0 x 1.0
  anchors: Box<[(f32, f32)]>,
}

impl RegionDecoder {
  pub fn new() -> Self {
    Self {
      anchors: Box::new([]),
    }
  }

  pub fn with_anchors(mut self, anchors: Vec<(f32, f32)>) -> Self {
    self.anchors = anchors.into_boxed_slice();
    self
  }

  fn anchor(&self, index: usize) -> (f32, f32) {
    self.anchors.get(index).copied().unwrap_or((1.0, 1.0))
  }
}

impl Default for RegionDecoder {
  fn default() -> Self {
    Self::new()
  }
}

impl BoxDecoder for RegionDecoder {
  type Error = RegionDecodeError;

  /// `hier_threshold` 只对层级类别树生效；本解码器不携带类别树，
  /// 参数仅为满足接口契约而接受。
  fn decode_boxes(
    &self,
    geometry: &LayerGeometry,
    image_size: (usize, usize),
    net_size: (usize, usize),
    threshold: f32,
    _hier_threshold: f32,
    raw: &RawOutput,
    view: FrameView<'_>,
  ) -> Result<(), RegionDecodeError> {
    let expected = geometry.output_len();
    if raw.data.len() != expected {
      return Err(RegionDecodeError::OutputMismatch {
        expected,
        found: raw.data.len(),
      });
    }

    let entry = geometry.entry_len();
    let layer_w = geometry.width as f32;
    let layer_h = geometry.height as f32;

    for (index, record) in view.boxes.iter_mut().enumerate() {
      let cell = index / geometry.boxes_per_cell;
      let anchor_index = index % geometry.boxes_per_cell;
      let row = (cell / geometry.width) as f32;
      let col = (cell % geometry.width) as f32;
      let data = &raw.data[index * entry..(index + 1) * entry];

      let (anchor_w, anchor_h) = self.anchor(anchor_index);
      let objectness = logistic(data[geometry.coords]);

      *record = BoxRecord {
        x: (col + logistic(data[0])) / layer_w,
        y: (row + logistic(data[1])) / layer_h,
        w: data[2].exp() * anchor_w / layer_w,
        h: data[3].exp() * anchor_h / layer_h,
        objectness,
      };

      let probs = &mut view.probs[index];
      let mut best = 0.0f32;
      for class_id in 0..geometry.classes {
        let prob = objectness * data[geometry.coords + 1 + class_id];
        probs[class_id] = if prob > threshold { prob } else { 0.0 };
        if prob > best {
          best = prob;
        }
      }
      probs[geometry.classes] = best;
    }

    if let Some(masks) = view.masks {
      let mask_len = geometry.mask_len();
      for (index, mask) in masks.iter_mut().enumerate() {
        let data = &raw.data[index * entry..(index + 1) * entry];
        mask.copy_from_slice(&data[4..4 + mask_len]);
      }
    }

    correct_boxes(view.boxes, image_size, net_size);
    debug!("区域解码完成, 候选框 {} 个", geometry.cell_count());
    Ok(())
  }
}

/// 信箱缩放的坐标还原：把相对网络输入的框坐标换算回相对原图。
fn correct_boxes(boxes: &mut [BoxRecord], image_size: (usize, usize), net_size: (usize, usize)) {
  let (img_w, img_h) = (image_size.0 as f32, image_size.1 as f32);
  let (net_w, net_h) = (net_size.0 as f32, net_size.1 as f32);

  let (new_w, new_h) = if net_w / img_w < net_h / img_h {
    (net_w, img_h * net_w / img_w)
  } else {
    (img_w * net_h / img_h, net_h)
  };

  for record in boxes {
    record.x = (record.x - (net_w - new_w) / 2.0 / net_w) / (new_w / net_w);
    record.y = (record.y - (net_h - new_h) / 2.0 / net_h) / (new_h / net_h);
    record.w *= net_w / new_w;
    record.h *= net_h / new_h;
  }
}

/// 按类别贪心抑制：每个类别内按概率降序，与更高分框交并比超过
/// `overlap` 的候选框概率清零。
pub fn nms_sort(boxes: &[BoxRecord], probs: &mut [Box<[f32]>], classes: usize, overlap: f32) {
  let mut order: Vec<usize> = (0..boxes.len()).collect();

  for class_id in 0..classes {
    order.sort_by(|&a, &b| {
      probs[b][class_id]
        .partial_cmp(&probs[a][class_id])
        .unwrap_or(std::cmp::Ordering::Equal)
    });

    for i in 0..order.len() {
      if probs[order[i]][class_id] == 0.0 {
        continue;
      }
      for j in (i + 1)..order.len() {
        if iou(&boxes[order[i]], &boxes[order[j]]) > overlap {
          probs[order[j]][class_id] = 0.0;
        }
      }
    }
  }
}

/// 计算两个中心格式边界框的交并比。
pub fn iou(a: &BoxRecord, b: &BoxRecord) -> f32 {
  let x1 = (a.x - a.w / 2.0).max(b.x - b.w / 2.0);
  let y1 = (a.y - a.h / 2.0).max(b.y - b.h / 2.0);
  let x2 = (a.x + a.w / 2.0).min(b.x + b.w / 2.0);
  let y2 = (a.y + a.h / 2.0).min(b.y + b.h / 2.0);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = a.w * a.h + b.w * b.h - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

fn logistic(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::{FrameBuffers, SystemAlloc};

  fn geometry(classes: usize, coords: usize) -> LayerGeometry {
    LayerGeometry {
      width: 1,
      height: 1,
      boxes_per_cell: 1,
      classes,
      coords,
    }
  }

  fn prepared(geometry: &LayerGeometry) -> FrameBuffers {
    let mut buffers = FrameBuffers::empty();
    let mut alloc = SystemAlloc::default();
    buffers.prepare(geometry, &mut alloc).unwrap();
    buffers
  }

  #[test]
  fn decode_single_candidate() {
    let geometry = geometry(2, 4);
    let mut buffers = prepared(&geometry);
    let raw = RawOutput {
      data: vec![0.0, 0.0, 0.0, 0.0, 30.0, 0.9, 0.2].into_boxed_slice(),
    };

    RegionDecoder::new()
      .decode_boxes(&geometry, (32, 32), (32, 32), 0.5, 0.5, &raw, buffers.filled_view().unwrap())
      .unwrap();

    let boxes = buffers.boxes().unwrap();
    assert!((boxes[0].x - 0.5).abs() < 1e-6);
    assert!((boxes[0].y - 0.5).abs() < 1e-6);
    assert!((boxes[0].w - 1.0).abs() < 1e-6);
    assert!((boxes[0].objectness - 1.0).abs() < 1e-6);

    let probs = buffers.probs().unwrap();
    assert!((probs[0][0] - 0.9).abs() < 1e-6);
    assert_eq!(probs[0][1], 0.0);
    assert!((probs[0][2] - 0.9).abs() < 1e-6);
  }

  #[test]
  fn probability_equal_to_threshold_is_zeroed() {
    let geometry = geometry(2, 4);
    let mut buffers = prepared(&geometry);
    // logistic(30) 在 f32 下恰为 1.0，因此概率恰等于阈值 0.5
    let raw = RawOutput {
      data: vec![0.0, 0.0, 0.0, 0.0, 30.0, 0.5, 0.5000002].into_boxed_slice(),
    };

    RegionDecoder::new()
      .decode_boxes(&geometry, (32, 32), (32, 32), 0.5, 0.5, &raw, buffers.filled_view().unwrap())
      .unwrap();

    let probs = buffers.probs().unwrap();
    assert_eq!(probs[0][0], 0.0);
    assert!(probs[0][1] > 0.5);
  }

  #[test]
  fn mask_coordinates_are_copied() {
    let geometry = geometry(1, 6);
    let mut buffers = prepared(&geometry);
    let raw = RawOutput {
      data: vec![0.0, 0.0, 0.0, 0.0, 0.25, 0.75, 30.0, 0.9].into_boxed_slice(),
    };

    RegionDecoder::new()
      .decode_boxes(&geometry, (32, 32), (32, 32), 0.5, 0.5, &raw, buffers.filled_view().unwrap())
      .unwrap();

    let masks = buffers.masks().unwrap();
    assert_eq!(&masks[0][..], &[0.25, 0.75]);
  }

  #[test]
  fn raw_length_is_validated() {
    let geometry = geometry(2, 4);
    let mut buffers = prepared(&geometry);
    let raw = RawOutput {
      data: vec![0.0; 3].into_boxed_slice(),
    };

    let err = RegionDecoder::new().decode_boxes(
      &geometry,
      (32, 32),
      (32, 32),
      0.5,
      0.5,
      &raw,
      buffers.filled_view().unwrap(),
    );
    assert!(matches!(
      err,
      Err(RegionDecodeError::OutputMismatch { expected: 7, found: 3 })
    ));
  }

  #[test]
  fn letterbox_correction_rescales_boxes() {
    // 原图 64x32, 网络 32x32：信箱高度折半，框高应放大一倍
    let mut boxes = [BoxRecord {
      x: 0.5,
      y: 0.5,
      w: 0.25,
      h: 0.25,
      objectness: 1.0,
    }];

    correct_boxes(&mut boxes, (64, 32), (32, 32));

    assert!((boxes[0].x - 0.5).abs() < 1e-6);
    assert!((boxes[0].y - 0.5).abs() < 1e-6);
    assert!((boxes[0].w - 0.25).abs() < 1e-6);
    assert!((boxes[0].h - 0.5).abs() < 1e-6);
  }

  #[test]
  fn nms_suppresses_overlapping_same_class() {
    let boxes = [
      BoxRecord { x: 0.5, y: 0.5, w: 0.4, h: 0.4, objectness: 0.9 },
      BoxRecord { x: 0.52, y: 0.5, w: 0.4, h: 0.4, objectness: 0.8 },
      BoxRecord { x: 0.9, y: 0.9, w: 0.1, h: 0.1, objectness: 0.7 },
    ];
    let mut probs: Vec<Box<[f32]>> = vec![
      vec![0.9, 0.0].into_boxed_slice(),
      vec![0.8, 0.7].into_boxed_slice(),
      vec![0.6, 0.0].into_boxed_slice(),
    ];

    nms_sort(&boxes, &mut probs, 2, 0.45);

    // 与最高分框重叠的同类框被清零，不同类与不重叠的保留
    assert_eq!(probs[1][0], 0.0);
    assert!((probs[1][1] - 0.7).abs() < 1e-6);
    assert!((probs[0][0] - 0.9).abs() < 1e-6);
    assert!((probs[2][0] - 0.6).abs() < 1e-6);
  }

  #[test]
  fn iou_bounds() {
    let a = BoxRecord { x: 0.5, y: 0.5, w: 0.2, h: 0.2, objectness: 1.0 };
    let b = BoxRecord { x: 0.9, y: 0.9, w: 0.1, h: 0.1, objectness: 1.0 };

    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    assert_eq!(iou(&a, &b), 0.0);
  }
}
