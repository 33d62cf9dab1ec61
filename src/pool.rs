// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 有界工作线程池
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

use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use tracing::{debug, trace};

/// 固定大小的线程池，每个阶段的任务在这里并行执行
pub struct WorkerPool {
  name: &'static str,
  pool: ThreadPool,
}

impl WorkerPool {
  pub fn new(name: &'static str, size: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
    let pool = ThreadPoolBuilder::new()
      .num_threads(size)
      .thread_name(move |index| format!("{}-{}", name, index))
      .build()?;
    debug!("创建线程池 {}，共 {} 个线程", name, size);
    Ok(Self { name, pool })
  }

  pub fn size(&self) -> usize {
    self.pool.current_num_threads()
  }

  /// 在池中并行处理全部任务，所有任务结束后才返回，结果顺序与输入一致
  pub fn fan_out<T, R, F>(&self, items: Vec<T>, task: F) -> Vec<R>
  where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Send + Sync,
  {
    if items.is_empty() {
      return Vec::new();
    }
    trace!("{} 池分发 {} 个任务", self.name, items.len());
    self
      .pool
      .install(|| items.into_par_iter().map(task).collect())
  }
}
