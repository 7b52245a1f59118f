// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/session.rs - 检测会话生命周期
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::accel::{self, AcceleratorError, AcceleratorToken};
use crate::backend::{InputShape, LayerGeometry, Network, NetworkLoader};
use crate::buffer::SystemAlloc;
use crate::{FromUrl, FromUrlWithScheme};

pub const DEFAULT_WORKER_THREADS: usize = 4;

const SESSION_SCHEME: &str = "yolo";

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("模型加载失败: {0}")]
  ModelLoad(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("工作线程池创建失败: {0}")]
  PoolCreation(#[from] rayon::ThreadPoolBuildError),
  #[error("加速库初始化失败: {0}")]
  Accelerator(#[from] AcceleratorError),
  #[error("会话地址无效: {0}")]
  InvalidUrl(String),
}

/// 会话创建参数。`config`/`weights` 交给模型加载器，`names` 是
/// 标签文件路径（检测调用首次需要标签时读取），`threads` 为工作
/// 线程池大小，`accelerator` 控制是否在创建时获取进程级加速凭证。
#[derive(Debug, Clone)]
pub struct SessionOptions {
  pub config: PathBuf,
  pub weights: PathBuf,
  pub names: PathBuf,
  pub threads: usize,
  pub accelerator: bool,
}

impl SessionOptions {
  pub fn new(
    config: impl Into<PathBuf>,
    weights: impl Into<PathBuf>,
    names: impl Into<PathBuf>,
  ) -> Self {
    Self {
      config: config.into(),
      weights: weights.into(),
      names: names.into(),
      threads: DEFAULT_WORKER_THREADS,
      accelerator: false,
    }
  }

  pub fn threads(mut self, threads: usize) -> Self {
    self.threads = threads;
    self
  }

  pub fn accelerator(mut self, accelerator: bool) -> Self {
    self.accelerator = accelerator;
    self
  }
}

impl FromUrl for SessionOptions {
  type Error = SessionError;

  fn from_url(url: &Url) -> Result<Self, SessionError> {
    if url.scheme() != SESSION_SCHEME {
      return Err(SessionError::InvalidUrl(format!(
        "会话地址必须使用 {} 方案",
        SESSION_SCHEME
      )));
    }

    let mut weights = None;
    let mut names = None;
    let mut threads = DEFAULT_WORKER_THREADS;
    let mut accelerator = false;

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "weights" => weights = Some(PathBuf::from(value.as_ref())),
        "names" => names = Some(PathBuf::from(value.as_ref())),
        "threads" => {
          threads = value
            .parse()
            .map_err(|_| SessionError::InvalidUrl(format!("threads 参数无效: {value}")))?;
        }
        "accel" => accelerator = matches!(value.as_ref(), "1" | "true"),
        other => {
          return Err(SessionError::InvalidUrl(format!("未知查询参数: {other}")));
        }
      }
    }

    Ok(SessionOptions {
      config: PathBuf::from(url.path()),
      weights: weights
        .ok_or_else(|| SessionError::InvalidUrl("缺少 weights 参数".to_string()))?,
      names: names.ok_or_else(|| SessionError::InvalidUrl("缺少 names 参数".to_string()))?,
      threads,
      accelerator,
    })
  }
}

impl FromUrlWithScheme for SessionOptions {
  const SCHEME: &'static str = SESSION_SCHEME;
}

/// 检测会话：持有已加载的网络与生命周期严格包含在会话内的
/// 固定大小工作线程池。
///
/// 同一会话同一时刻只允许一次在途检测调用；`detect` 取 `&mut self`，
/// 由编译器保证，无需内部加锁。跨线程复用会话由调用方自行串行化。
pub struct Session<N: Network> {
  pub(crate) net: N,
  pub(crate) pool: rayon::ThreadPool,
  pub(crate) accel: Option<AcceleratorToken>,
  pub(crate) names: PathBuf,
  pub(crate) alloc: SystemAlloc,
}

impl<N: Network> Session<N> {
  /// 创建会话：加载模型，按需获取加速凭证，再创建工作线程池。
  /// 线程池创建失败时已加载的模型与加速凭证随错误返回一并释放。
  pub fn create<L>(loader: &L, options: &SessionOptions) -> Result<Self, SessionError>
  where
    L: NetworkLoader<Network = N>,
  {
    let net = loader
      .load(&options.config, &options.weights)
      .map_err(|e| SessionError::ModelLoad(Box::new(e)))?;

    let accel = if options.accelerator {
      Some(accel::initialize()?)
    } else {
      None
    };

    info!("创建工作线程池, 线程数: {}", options.threads);
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(options.threads)
      .build()?;

    info!("会话创建完成");
    Ok(Session {
      net,
      pool,
      accel,
      names: options.names.clone(),
      alloc: SystemAlloc::default(),
    })
  }

  pub fn input_shape(&self) -> InputShape {
    self.net.input_shape()
  }

  pub fn detection_geometry(&self) -> LayerGeometry {
    self.net.detection_geometry()
  }

  pub fn pool(&self) -> &rayon::ThreadPool {
    &self.pool
  }

  /// 会话累计的缓冲区分配次数。
  pub fn buffer_allocations(&self) -> u64 {
    self.alloc.allocations()
  }

  /// 销毁会话：释放线程池与模型。`deinit` 为真时消耗加速凭证
  /// （反初始化加速库），否则把仍然有效的凭证交还调用方，
  /// 配对义务随之转移。
  pub fn close(mut self, deinit: bool) -> Option<AcceleratorToken> {
    info!("销毁会话");
    let token = self.accel.take();
    if deinit {
      if let Some(token) = token {
        accel::deinitialize(token);
      }
      None
    } else {
      token
    }
  }
}
