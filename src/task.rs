// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 通道的持续运行任务
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
  sync::mpsc::{self, Receiver, Sender, TryRecvError},
  thread::{self, JoinHandle},
  time::Instant,
};

use tracing::{info, warn};

use crate::{channel::Channel, error::ChannelError, result::SourceResult};

/// 反复运行通道周期，直到收到停止信号、达到指定周期数或所有源都已结束
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
}

/// 停止信号，可以克隆后交给信号处理函数
#[derive(Clone, Debug)]
pub struct StopHandle {
  tx: Sender<()>,
}

impl StopHandle {
  pub fn stop(&self) {
    let _ = self.tx.send(());
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 在当前线程运行，返回完成的周期数
  pub fn run_task<F>(
    self,
    channel: &mut Channel,
    stop: &Receiver<()>,
    mut on_result: F,
  ) -> Result<usize, ChannelError>
  where
    F: FnMut(usize, Vec<SourceResult>),
  {
    info!("开始任务...");
    let mut cycle = 0;
    loop {
      match stop.try_recv() {
        Err(TryRecvError::Empty) => {}
        _ => {
          warn!("收到停止信号，退出任务循环");
          break;
        }
      }
      if channel.source_names().is_empty() {
        info!("所有源都已结束，退出任务循环");
        break;
      }

      let now = Instant::now();
      let results = channel.run()?;
      cycle += 1;
      info!(
        "第 {} 个周期完成，{} 条结果，耗时: {:.2?}",
        cycle,
        results.len(),
        now.elapsed()
      );
      on_result(cycle, results);

      if self.frame_number.is_some_and(|n| cycle >= n) {
        info!("达到指定周期数 {}, 退出任务循环", cycle);
        break;
      }
    }

    info!("任务完成，退出");
    Ok(cycle)
  }

  /// 在独立线程中运行，线程持有通道，结束时通道随之释放
  pub fn spawn<F>(self, mut channel: Channel, on_result: F) -> TaskHandle
  where
    F: FnMut(usize, Vec<SourceResult>) + Send + 'static,
  {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || self.run_task(&mut channel, &rx, on_result));
    TaskHandle {
      stop: StopHandle { tx },
      handle: Some(handle),
    }
  }
}

pub struct TaskHandle {
  stop: StopHandle,
  handle: Option<JoinHandle<Result<usize, ChannelError>>>,
}

impl TaskHandle {
  pub fn stop_handle(&self) -> StopHandle {
    self.stop.clone()
  }

  pub fn is_finished(&self) -> bool {
    self.handle.as_ref().is_none_or(JoinHandle::is_finished)
  }

  /// 等待任务自然结束
  pub fn join(mut self) -> Result<usize, ChannelError> {
    self.wait()
  }

  /// 发送停止信号并等待任务结束
  pub fn stop(mut self) -> Result<usize, ChannelError> {
    self.stop.stop();
    self.wait()
  }

  fn wait(&mut self) -> Result<usize, ChannelError> {
    match self.handle.take() {
      Some(handle) => match handle.join() {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
      },
      None => Ok(0),
    }
  }
}

impl Drop for TaskHandle {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      self.stop.stop();
      match handle.join() {
        Ok(Err(e)) => warn!("任务异常结束: {}", e),
        Err(_) => warn!("任务线程崩溃"),
        Ok(Ok(_)) => {}
      }
    }
  }
}
