// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/buffer.rs - 检测输出缓冲区协议
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

use crate::backend::LayerGeometry;

#[derive(Error, Debug)]
pub enum BufferError {
  #[error("缓冲区分配失败: {0}")]
  Allocation(&'static str),
  #[error("缓冲区形状不匹配: {buffer} 期望长度 {expected}, 实际长度 {found}")]
  ShapeMismatch {
    buffer: &'static str,
    expected: usize,
    found: usize,
  },
  #[error("缓冲区尚未准备就绪")]
  Incomplete,
}

/// 候选框记录：中心坐标、宽高与目标置信度。
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoxRecord {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
  pub objectness: f32,
}

/// 缓冲区槽位：要么为空（本次调用负责分配并交还），
/// 要么由调用方带入上一次调用的缓冲区原样复用。
#[derive(Debug, Default)]
pub enum BufferSlot<T> {
  #[default]
  Empty,
  Filled(T),
}

impl<T> BufferSlot<T> {
  pub fn is_empty(&self) -> bool {
    matches!(self, BufferSlot::Empty)
  }

  pub fn as_ref(&self) -> Option<&T> {
    match self {
      BufferSlot::Empty => None,
      BufferSlot::Filled(value) => Some(value),
    }
  }
}

/// 单个槽位在本次调用中的来源。`Fresh` 槽位在调用失败时回滚为空，
/// `Reused` 槽位属于调用方，绝不释放。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
  Reused,
  Fresh,
}

/// 一次 prepare 的来源记录，驱动失败路径上的回滚。
#[derive(Debug, Clone, Copy)]
pub struct FrameProvenance {
  pub boxes: Provenance,
  pub probs: Provenance,
  pub masks: Option<Provenance>,
}

impl Default for FrameProvenance {
  fn default() -> Self {
    Self {
      boxes: Provenance::Reused,
      probs: Provenance::Reused,
      masks: None,
    }
  }
}

/// 缓冲区分配器接口。检测调用的每一步分配都经过这里，
/// 以便统计分配次数，也便于测试注入失败。
pub trait BufferAlloc {
  fn alloc_boxes(&mut self, n: usize) -> Result<Box<[BoxRecord]>, BufferError>;
  fn alloc_outer(&mut self, n: usize) -> Result<Vec<Box<[f32]>>, BufferError>;
  fn alloc_inner(&mut self, len: usize) -> Result<Box<[f32]>, BufferError>;
}

/// 默认分配器，附带分配计数。
#[derive(Debug, Default)]
pub struct SystemAlloc {
  count: u64,
}

impl SystemAlloc {
  pub fn allocations(&self) -> u64 {
    self.count
  }
}

impl BufferAlloc for SystemAlloc {
  fn alloc_boxes(&mut self, n: usize) -> Result<Box<[BoxRecord]>, BufferError> {
    self.count += 1;
    Ok(vec![BoxRecord::default(); n].into_boxed_slice())
  }

  fn alloc_outer(&mut self, n: usize) -> Result<Vec<Box<[f32]>>, BufferError> {
    self.count += 1;
    Ok(Vec::with_capacity(n))
  }

  fn alloc_inner(&mut self, len: usize) -> Result<Box<[f32]>, BufferError> {
    self.count += 1;
    Ok(vec![0.0; len].into_boxed_slice())
  }
}

/// 已就绪缓冲区的可写视图，供框解码器就地填充。
pub struct FrameView<'a> {
  pub boxes: &'a mut [BoxRecord],
  pub probs: &'a mut [Box<[f32]>],
  pub masks: Option<&'a mut [Box<[f32]>]>,
}

/// 单次检测调用的输出缓冲区组。
///
/// 所有权协议：`boxes`/`probs`/`masks` 三个槽位相互独立，要么由调用方
/// 带入上一次调用的缓冲区（形状必须与当前几何一致，原样复用），要么
/// 传入空槽位、由本次调用分配后通过同一槽位交还调用方。被调用方绝不
/// 释放调用方带入的缓冲区；本次调用新分配的缓冲区在调用失败时全部
/// 回滚为空，调用方不会看到悬空或半初始化的状态。
#[derive(Debug, Default)]
pub struct FrameBuffers {
  boxes: BufferSlot<Box<[BoxRecord]>>,
  probs: BufferSlot<Box<[Box<[f32]>]>>,
  masks: BufferSlot<Box<[Box<[f32]>]>>,
}

impl FrameBuffers {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn supply_boxes(&mut self, boxes: Box<[BoxRecord]>) {
    self.boxes = BufferSlot::Filled(boxes);
  }

  pub fn supply_probs(&mut self, probs: Box<[Box<[f32]>]>) {
    self.probs = BufferSlot::Filled(probs);
  }

  pub fn supply_masks(&mut self, masks: Box<[Box<[f32]>]>) {
    self.masks = BufferSlot::Filled(masks);
  }

  pub fn boxes(&self) -> Option<&[BoxRecord]> {
    self.boxes.as_ref().map(|b| &b[..])
  }

  pub fn probs(&self) -> Option<&[Box<[f32]>]> {
    self.probs.as_ref().map(|p| &p[..])
  }

  pub fn masks(&self) -> Option<&[Box<[f32]>]> {
    self.masks.as_ref().map(|m| &m[..])
  }

  /// 释放全部槽位。
  pub fn clear(&mut self) {
    self.masks = BufferSlot::Empty;
    self.probs = BufferSlot::Empty;
    self.boxes = BufferSlot::Empty;
  }

  /// 按固定顺序 boxes → probs（外层及 N 个内层）→ masks（仅当
  /// `coords > 4`）准备缓冲区：空槽位走分配路径，非空槽位校验形状后
  /// 复用。任何一步失败都会撤销本次已完成的新分配（内层向量通过丢弃
  /// 局部半成品展开，先前阶段通过 [`FrameBuffers::rollback`]），调用方
  /// 带入的缓冲区保持原样。
  pub fn prepare<A: BufferAlloc>(
    &mut self,
    geometry: &LayerGeometry,
    alloc: &mut A,
  ) -> Result<FrameProvenance, BufferError> {
    let mut provenance = FrameProvenance::default();
    match self.try_prepare(geometry, alloc, &mut provenance) {
      Ok(()) => Ok(provenance),
      Err(e) => {
        self.rollback(&provenance);
        Err(e)
      }
    }
  }

  fn try_prepare<A: BufferAlloc>(
    &mut self,
    geometry: &LayerGeometry,
    alloc: &mut A,
    provenance: &mut FrameProvenance,
  ) -> Result<(), BufferError> {
    let n = geometry.cell_count();

    match &self.boxes {
      BufferSlot::Filled(boxes) => {
        if boxes.len() != n {
          return Err(BufferError::ShapeMismatch {
            buffer: "boxes",
            expected: n,
            found: boxes.len(),
          });
        }
      }
      BufferSlot::Empty => {
        self.boxes = BufferSlot::Filled(alloc.alloc_boxes(n)?);
        provenance.boxes = Provenance::Fresh;
      }
    }

    let prob_len = geometry.prob_len();
    match &self.probs {
      BufferSlot::Filled(probs) => {
        validate_jagged("probs", probs, n, prob_len)?;
      }
      BufferSlot::Empty => {
        self.probs = BufferSlot::Filled(alloc_jagged(alloc, n, prob_len)?);
        provenance.probs = Provenance::Fresh;
      }
    }

    if geometry.has_masks() {
      let mask_len = geometry.mask_len();
      match &self.masks {
        BufferSlot::Filled(masks) => {
          validate_jagged("masks", masks, n, mask_len)?;
          provenance.masks = Some(Provenance::Reused);
        }
        BufferSlot::Empty => {
          self.masks = BufferSlot::Filled(alloc_jagged(alloc, n, mask_len)?);
          provenance.masks = Some(Provenance::Fresh);
        }
      }
    } else if let BufferSlot::Filled(masks) = &self.masks {
      // 掩码的有无由几何整体决定，coords <= 4 时不接受掩码缓冲区
      return Err(BufferError::ShapeMismatch {
        buffer: "masks",
        expected: 0,
        found: masks.len(),
      });
    }

    Ok(())
  }

  /// 按与分配相反的顺序清空本次调用新分配的槽位，
  /// 调用方带入的槽位不受影响。
  pub fn rollback(&mut self, provenance: &FrameProvenance) {
    if provenance.masks == Some(Provenance::Fresh) {
      self.masks = BufferSlot::Empty;
    }
    if provenance.probs == Provenance::Fresh {
      self.probs = BufferSlot::Empty;
    }
    if provenance.boxes == Provenance::Fresh {
      self.boxes = BufferSlot::Empty;
    }
    debug!("已回滚本次调用新分配的缓冲区");
  }

  /// 三个槽位均就绪时返回可写视图，否则返回 `None`。
  pub fn filled_view(&mut self) -> Option<FrameView<'_>> {
    match (&mut self.boxes, &mut self.probs, &mut self.masks) {
      (BufferSlot::Filled(boxes), BufferSlot::Filled(probs), BufferSlot::Filled(masks)) => {
        Some(FrameView {
          boxes,
          probs,
          masks: Some(masks),
        })
      }
      (BufferSlot::Filled(boxes), BufferSlot::Filled(probs), BufferSlot::Empty) => {
        Some(FrameView {
          boxes,
          probs,
          masks: None,
        })
      }
      _ => None,
    }
  }
}

fn alloc_jagged<A: BufferAlloc>(
  alloc: &mut A,
  n: usize,
  len: usize,
) -> Result<Box<[Box<[f32]>]>, BufferError> {
  let mut outer = alloc.alloc_outer(n)?;
  for _ in 0..n {
    // 内层分配失败时，半成品 outer 连同已分配的内层向量一并丢弃
    outer.push(alloc.alloc_inner(len)?);
  }
  Ok(outer.into_boxed_slice())
}

fn validate_jagged(
  buffer: &'static str,
  jagged: &[Box<[f32]>],
  n: usize,
  len: usize,
) -> Result<(), BufferError> {
  if jagged.len() != n {
    return Err(BufferError::ShapeMismatch {
      buffer,
      expected: n,
      found: jagged.len(),
    });
  }
  for row in jagged {
    if row.len() != len {
      return Err(BufferError::ShapeMismatch {
        buffer,
        expected: len,
        found: row.len(),
      });
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn geometry(coords: usize) -> LayerGeometry {
    LayerGeometry {
      width: 2,
      height: 1,
      boxes_per_cell: 2,
      classes: 2,
      coords,
    }
  }

  /// 在第 `fail_at` 次分配（从 1 起）注入失败。
  struct FailingAlloc {
    inner: SystemAlloc,
    fail_at: u64,
    made: u64,
  }

  impl FailingAlloc {
    fn new(fail_at: u64) -> Self {
      Self {
        inner: SystemAlloc::default(),
        fail_at,
        made: 0,
      }
    }

    fn tick(&mut self) -> Result<(), BufferError> {
      self.made += 1;
      if self.made == self.fail_at {
        Err(BufferError::Allocation("注入的分配失败"))
      } else {
        Ok(())
      }
    }
  }

  impl BufferAlloc for FailingAlloc {
    fn alloc_boxes(&mut self, n: usize) -> Result<Box<[BoxRecord]>, BufferError> {
      self.tick()?;
      self.inner.alloc_boxes(n)
    }

    fn alloc_outer(&mut self, n: usize) -> Result<Vec<Box<[f32]>>, BufferError> {
      self.tick()?;
      self.inner.alloc_outer(n)
    }

    fn alloc_inner(&mut self, len: usize) -> Result<Box<[f32]>, BufferError> {
      self.tick()?;
      self.inner.alloc_inner(len)
    }
  }

  #[test]
  fn prepare_allocates_expected_shapes() {
    let mut buffers = FrameBuffers::empty();
    let mut alloc = SystemAlloc::default();

    let provenance = buffers.prepare(&geometry(4), &mut alloc).unwrap();

    assert_eq!(provenance.boxes, Provenance::Fresh);
    assert_eq!(provenance.probs, Provenance::Fresh);
    assert!(provenance.masks.is_none());

    assert_eq!(buffers.boxes().unwrap().len(), 4);
    let probs = buffers.probs().unwrap();
    assert_eq!(probs.len(), 4);
    assert!(probs.iter().all(|row| row.len() == 3));
    assert!(buffers.masks().is_none());
  }

  #[test]
  fn prepare_allocates_masks_when_coords_exceed_four() {
    let mut buffers = FrameBuffers::empty();
    let mut alloc = SystemAlloc::default();

    let provenance = buffers.prepare(&geometry(6), &mut alloc).unwrap();

    assert_eq!(provenance.masks, Some(Provenance::Fresh));
    let masks = buffers.masks().unwrap();
    assert_eq!(masks.len(), 4);
    assert!(masks.iter().all(|row| row.len() == 2));
  }

  #[test]
  fn second_prepare_reuses_without_allocating() {
    let mut buffers = FrameBuffers::empty();
    let mut alloc = SystemAlloc::default();

    buffers.prepare(&geometry(6), &mut alloc).unwrap();
    let after_first = alloc.allocations();

    let provenance = buffers.prepare(&geometry(6), &mut alloc).unwrap();

    assert_eq!(alloc.allocations(), after_first);
    assert_eq!(provenance.boxes, Provenance::Reused);
    assert_eq!(provenance.probs, Provenance::Reused);
    assert_eq!(provenance.masks, Some(Provenance::Reused));
  }

  #[test]
  fn reused_boxes_shape_is_validated() {
    let mut buffers = FrameBuffers::empty();
    buffers.supply_boxes(vec![BoxRecord::default(); 7].into_boxed_slice());
    let mut alloc = SystemAlloc::default();

    let err = buffers.prepare(&geometry(4), &mut alloc);
    assert!(matches!(
      err,
      Err(BufferError::ShapeMismatch { buffer: "boxes", expected: 4, found: 7 })
    ));
    // 形状不符的缓冲区仍然归调用方所有
    assert_eq!(buffers.boxes().unwrap().len(), 7);
  }

  #[test]
  fn masks_rejected_for_maskless_geometry() {
    let mut buffers = FrameBuffers::empty();
    buffers.supply_masks(vec![vec![0.0; 2].into_boxed_slice(); 4].into_boxed_slice());
    let mut alloc = SystemAlloc::default();

    let err = buffers.prepare(&geometry(4), &mut alloc);
    assert!(matches!(
      err,
      Err(BufferError::ShapeMismatch { buffer: "masks", .. })
    ));
    assert!(buffers.masks().is_some());
  }

  // 分配序号（geometry(6), 全空槽位）：
  //   1 boxes, 2 probs 外层, 3..6 probs 内层, 7 masks 外层, 8..11 masks 内层
  #[test]
  fn failure_at_each_stage_leaves_slots_empty() {
    for fail_at in [1, 2, 4, 7, 9] {
      let mut buffers = FrameBuffers::empty();
      let mut alloc = FailingAlloc::new(fail_at);

      let err = buffers.prepare(&geometry(6), &mut alloc);
      assert!(matches!(err, Err(BufferError::Allocation(_))), "fail_at={fail_at}");
      assert!(buffers.boxes().is_none(), "fail_at={fail_at}");
      assert!(buffers.probs().is_none(), "fail_at={fail_at}");
      assert!(buffers.masks().is_none(), "fail_at={fail_at}");
    }
  }

  #[test]
  fn caller_buffers_survive_later_failure() {
    let mut buffers = FrameBuffers::empty();
    let sentinel = BoxRecord {
      objectness: 0.75,
      ..BoxRecord::default()
    };
    buffers.supply_boxes(vec![sentinel; 4].into_boxed_slice());

    // boxes 被复用，第 1 次分配即 probs 外层
    let mut alloc = FailingAlloc::new(1);
    let err = buffers.prepare(&geometry(4), &mut alloc);

    assert!(matches!(err, Err(BufferError::Allocation(_))));
    let boxes = buffers.boxes().unwrap();
    assert_eq!(boxes.len(), 4);
    assert_eq!(boxes[0].objectness, 0.75);
    assert!(buffers.probs().is_none());
  }

  #[test]
  fn filled_view_requires_prepare() {
    let mut buffers = FrameBuffers::empty();
    assert!(buffers.filled_view().is_none());

    let mut alloc = SystemAlloc::default();
    buffers.prepare(&geometry(6), &mut alloc).unwrap();

    let view = buffers.filled_view().unwrap();
    assert_eq!(view.boxes.len(), 4);
    assert_eq!(view.probs.len(), 4);
    assert!(view.masks.is_some());
  }

  #[test]
  fn clear_releases_all_slots() {
    let mut buffers = FrameBuffers::empty();
    let mut alloc = SystemAlloc::default();
    buffers.prepare(&geometry(4), &mut alloc).unwrap();

    buffers.clear();
    assert!(buffers.boxes().is_none());
    assert!(buffers.probs().is_none());
  }
}
