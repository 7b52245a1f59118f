// 该文件是 Gongga （贡嘎雪线） 项目的一部分。
// src/bin/simple_detect.rs - 单帧检测演示
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use gongga::{
  FromUrl,
  backend::ReplayLoader,
  buffer::FrameBuffers,
  decoder::{RegionDecoder, nms_sort},
  detect::{DetectOptions, collect_hits},
  labels::{LabelSlot, NameFileLoader},
  pipeline::CodecPipeline,
  session::{Session, SessionOptions},
};

/// Gongga 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 会话地址
  /// 形如: yolo:///path/net.cfg?weights=/path/net.weights&names=/path/coco.names&threads=4&accel=true
  #[arg(long, value_name = "SESSION")]
  pub session: Url,

  /// 输入图像文件路径
  #[arg(long, value_name = "IMAGE")]
  pub input: std::path::PathBuf,

  /// 概率阈值（严格大于才报告）
  #[arg(long, default_value = "0.24", value_name = "THRESHOLD")]
  pub threshold: f32,

  /// 层级类别树阈值
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub hier_threshold: f32,

  /// 非极大值抑制的交并比阈值，缺省不做抑制
  #[arg(long, value_name = "OVERLAP")]
  pub nms: Option<f32>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("会话地址: {}", args.session);
  info!("输入图像: {}", args.input.display());

  let options = SessionOptions::from_url(&args.session)?;
  let deinit = options.accelerator;
  let mut session = Session::create(&ReplayLoader, &options)?;

  let image = std::fs::read(&args.input)?;
  let mut labels = LabelSlot::empty();
  let mut buffers = FrameBuffers::empty();
  let detect_options = DetectOptions {
    threshold: args.threshold,
    hier_threshold: args.hier_threshold,
  };

  info!("开始推理...");
  let now = std::time::Instant::now();
  let mut hits = session.detect(
    &image,
    &CodecPipeline,
    &RegionDecoder::new(),
    &NameFileLoader,
    &mut labels,
    &mut buffers,
    &detect_options,
  )?;
  info!("推理完成，耗时: {:.2?}", now.elapsed());

  if let Some(overlap) = args.nms {
    let classes = session.detection_geometry().classes;
    if let Some(view) = buffers.filled_view() {
      nms_sort(view.boxes, view.probs, classes, overlap);
      hits = collect_hits(view.probs, classes, args.threshold);
    }
  }

  for hit in hits.iter() {
    let name = labels
      .get()
      .and_then(|set| set.get(hit.class_id))
      .unwrap_or("unknown");
    println!("{}: {:.0}%", name, hit.score * 100.0);
  }
  info!("共检测到 {} 个目标", hits.len());

  session.close(deinit);
  Ok(())
}
