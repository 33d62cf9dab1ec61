// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 通道运行程序
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

use std::{
  io::{self, Write},
  path::PathBuf,
  thread,
  time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use shanan_channel::{ChannelBuilder, ChannelSpec, InferenceConfig, task::ContinuousTask};

/// Shanan 通道参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 通道描述文件（JSON）
  #[arg(long, value_name = "CONFIG")]
  pub config: PathBuf,
  /// 模型文件目录，模型文件名为 `<名称> <任务> <规模>.rknn`。
  /// RKNN 后端目前只支持检测任务，分割与姿态模型会加载失败
  #[arg(long, value_name = "MODEL_DIR", default_value = "static/models/rknn")]
  pub model_dir: PathBuf,
  /// 覆盖置信度阈值
  #[arg(long, value_name = "CONFIDENCE")]
  pub confidence: Option<f32>,
  /// 覆盖重叠阈值
  #[arg(long, value_name = "OVERLAP")]
  pub overlap: Option<f32>,
  /// 关闭实时跳帧
  #[arg(long)]
  pub no_realtime: bool,
  /// 运行的周期数，缺省时一直运行
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

#[derive(serde::Serialize)]
struct OutputLine<'a> {
  timestamp: String,
  cycle: usize,
  #[serde(flatten)]
  result: &'a shanan_channel::SourceResult,
}

#[cfg(feature = "model_yolo26")]
fn model_loader(args: &Args, _spec: &ChannelSpec) -> Result<shanan_channel::model::RknnModelLoader> {
  Ok(shanan_channel::model::RknnModelLoader::new(&args.model_dir))
}

/// 未编译推理后端时在打开任何源之前失败
#[cfg(not(feature = "model_yolo26"))]
fn model_loader(_args: &Args, spec: &ChannelSpec) -> Result<shanan_channel::model::NoBackendLoader> {
  anyhow::bail!(
    "未启用任何推理后端，无法加载 {} 个模型，请以 `--features model_yolo26` 重新编译",
    spec.models.len()
  )
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("通道描述文件: {}", args.config.display());
  info!("模型目录: {}", args.model_dir.display());

  let mut spec = ChannelSpec::from_path(&args.config)
    .with_context(|| format!("无法读取通道描述文件 {}", args.config.display()))?;
  spec.inference = InferenceConfig::new(
    args.confidence.unwrap_or(spec.inference.confidence),
    args.overlap.unwrap_or(spec.inference.overlap),
    spec.inference.augment,
    spec.inference.realtime && !args.no_realtime,
  )?;

  let channel = ChannelBuilder::from_spec(&spec)
    .loader(model_loader(&args, &spec)?)
    .build()?;

  let task = ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .spawn(channel, |cycle, results| {
      let mut stdout = io::stdout().lock();
      for result in &results {
        let line = OutputLine {
          timestamp: chrono::Local::now().to_rfc3339(),
          cycle,
          result,
        };
        match serde_json::to_string(&line) {
          Ok(text) => {
            let _ = writeln!(stdout, "{}", text);
          }
          Err(e) => error!("结果序列化失败: {}", e),
        }
      }
    });

  let stop = task.stop_handle();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    stop.stop();
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let cycles = task.join()?;
  info!("共运行 {} 个周期", cycles);

  Ok(())
}
