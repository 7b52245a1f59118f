// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/accel.rs - 加速库进程级初始化
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

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info};

static ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum AcceleratorError {
  #[error("加速库已初始化，同一进程内不允许重复初始化")]
  AlreadyInitialized,
}

/// 加速库初始化凭证。凭证存续期间加速库保持初始化状态；
/// 凭证被丢弃（或通过 [`deinitialize`] 消耗）时执行反初始化。
/// 加速库不支持引用计数，同一进程同一时刻只允许一枚凭证存在。
#[derive(Debug)]
pub struct AcceleratorToken {
  _private: (),
}

pub fn initialize() -> Result<AcceleratorToken, AcceleratorError> {
  if ACTIVE
    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
    .is_err()
  {
    return Err(AcceleratorError::AlreadyInitialized);
  }

  info!("加速库初始化完成");
  Ok(AcceleratorToken { _private: () })
}

pub fn deinitialize(token: AcceleratorToken) {
  drop(token);
}

pub fn is_initialized() -> bool {
  ACTIVE.load(Ordering::SeqCst)
}

impl Drop for AcceleratorToken {
  fn drop(&mut self) {
    ACTIVE.store(false, Ordering::SeqCst);
    debug!("加速库已反初始化");
  }
}

// 加速库状态是进程级的，涉及它的测试跨模块串行
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
  static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
  LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn initialize_and_deinitialize_pair() {
    let _guard = test_lock();

    let token = initialize().unwrap();
    assert!(is_initialized());

    deinitialize(token);
    assert!(!is_initialized());
  }

  #[test]
  fn double_initialize_rejected() {
    let _guard = test_lock();

    let token = initialize().unwrap();
    assert!(matches!(
      initialize(),
      Err(AcceleratorError::AlreadyInitialized)
    ));

    deinitialize(token);
    assert!(initialize().is_ok_and(|t| {
      deinitialize(t);
      true
    }));
  }

  #[test]
  fn drop_releases_state() {
    let _guard = test_lock();

    {
      let _token = initialize().unwrap();
      assert!(is_initialized());
    }
    assert!(!is_initialized());
  }
}
