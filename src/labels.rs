// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/labels.rs - 类别标签集
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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签加载失败: {0}")]
  Load(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("标签文件为空: {path}")]
  Empty { path: PathBuf },
  #[error("标签数量不足: 需要至少 {required} 个, 实际 {found} 个")]
  TooFew { required: usize, found: usize },
}

pub trait LabelLoader {
  type Error: std::error::Error + Send + Sync + 'static;

  fn load(&self, path: &Path) -> Result<Vec<String>, Self::Error>;
}

/// 按行读取名称列表文件，跳过空行。
#[derive(Debug, Default, Clone, Copy)]
pub struct NameFileLoader;

impl LabelLoader for NameFileLoader {
  type Error = std::io::Error;

  fn load(&self, path: &Path) -> Result<Vec<String>, Self::Error> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_names(&text))
  }
}

fn parse_names(text: &str) -> Vec<String> {
  text
    .lines()
    .map(str::trim_end)
    .filter(|line| !line.is_empty())
    .map(str::to_string)
    .collect()
}

/// 一次加载后在会话全程只读共享的类别名称序列。
#[derive(Debug)]
pub struct LabelSet {
  names: Box<[String]>,
}

impl LabelSet {
  pub fn new(names: Vec<String>) -> Self {
    Self {
      names: names.into_boxed_slice(),
    }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn get(&self, class_id: usize) -> Option<&str> {
    self.names.get(class_id).map(String::as_str)
  }
}

/// 调用方持有的标签缓存槽：未加载时检测调用会加载一次，
/// 之后的每次调用静默复用，避免视频流场景每帧重读文件。
#[derive(Debug, Default)]
pub struct LabelSlot {
  cached: Option<Arc<LabelSet>>,
}

impl LabelSlot {
  pub fn empty() -> Self {
    Self { cached: None }
  }

  /// 由调用方直接提供标签集，之后不会再触发加载。
  pub fn supplied(set: LabelSet) -> Self {
    Self {
      cached: Some(Arc::new(set)),
    }
  }

  pub fn get(&self) -> Option<&Arc<LabelSet>> {
    self.cached.as_ref()
  }

  /// 清空缓存，下一次检测调用会重新加载。
  pub fn clear(&mut self) {
    self.cached = None;
  }

  /// 槽位为空时加载标签文件并缓存；任何情况下都校验
  /// 标签数量不少于模型的类别数。标签不足视为加载失败，不会填充槽位。
  pub fn ensure<L: LabelLoader>(
    &mut self,
    loader: &L,
    path: &Path,
    classes: usize,
  ) -> Result<Arc<LabelSet>, LabelError> {
    if let Some(set) = &self.cached {
      if set.len() < classes {
        return Err(LabelError::TooFew {
          required: classes,
          found: set.len(),
        });
      }
      return Ok(Arc::clone(set));
    }

    let names = loader
      .load(path)
      .map_err(|e| LabelError::Load(Box::new(e)))?;
    if names.is_empty() {
      return Err(LabelError::Empty {
        path: path.to_path_buf(),
      });
    }
    if names.len() < classes {
      return Err(LabelError::TooFew {
        required: classes,
        found: names.len(),
      });
    }

    info!("加载标签文件: {}, 共 {} 类", path.display(), names.len());
    let set = Arc::new(LabelSet::new(names));
    self.cached = Some(Arc::clone(&set));
    Ok(set)
  }
}
