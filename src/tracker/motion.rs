// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tracker/motion.rs - 简化的检测框运动滤波
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

const VELOCITY_DECAY: f32 = 0.95;
const SIZE_DECAY: f32 = 0.98;

/// 对角协方差的卡尔曼滤波
///
/// 状态为 `[cx, cy, w, h, vx, vy, vw, vh]`，匀速模型，速度每帧衰减。
#[derive(Debug, Clone)]
pub(crate) struct MotionFilter {
  state: [f32; 8],
  p: [f32; 8],
  q: f32,
  r: f32,
}

impl MotionFilter {
  pub fn new(bbox: &[f32; 4], q: f32, r: f32) -> Self {
    let [cx, cy, w, h] = to_cxcywh(bbox);
    Self {
      state: [cx, cy, w, h, 0.0, 0.0, 0.0, 0.0],
      p: [10.0; 8],
      q,
      r,
    }
  }

  pub fn predict(&mut self) {
    for i in 4..6 {
      self.state[i] *= VELOCITY_DECAY;
    }
    for i in 6..8 {
      self.state[i] *= SIZE_DECAY;
    }
    for i in 0..4 {
      self.state[i] += self.state[i + 4];
    }
    for p in self.p.iter_mut() {
      *p += self.q;
    }
  }

  pub fn update(&mut self, bbox: &[f32; 4]) {
    let measured = to_cxcywh(bbox);
    let residual: [f32; 4] = std::array::from_fn(|i| measured[i] - self.state[i]);

    // 大幅跳变时更信任预测值
    let jump = (residual[0] * residual[0] + residual[1] * residual[1]).sqrt();
    let r = if jump < 10.0 { self.r } else { self.r * 3.0 };

    for i in 0..4 {
      let k = self.p[i] / (self.p[i] + r);
      self.state[i] += k * residual[i];
      self.p[i] *= 1.0 - k;

      let kv = self.p[i + 4] / (self.p[i + 4] + r * 10.0);
      self.state[i + 4] += kv * residual[i];
      self.p[i + 4] *= 1.0 - kv;
    }
  }

  pub fn bbox(&self) -> [f32; 4] {
    from_cxcywh(&self.state[..4])
  }
}

fn to_cxcywh(bbox: &[f32; 4]) -> [f32; 4] {
  [
    (bbox[0] + bbox[2]) / 2.0,
    (bbox[1] + bbox[3]) / 2.0,
    bbox[2] - bbox[0],
    bbox[3] - bbox[1],
  ]
}

fn from_cxcywh(state: &[f32]) -> [f32; 4] {
  let w = state[2].max(1.0);
  let h = state[3].max(1.0);
  [
    state[0] - w / 2.0,
    state[1] - h / 2.0,
    state[0] + w / 2.0,
    state[1] + h / 2.0,
  ]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn static_box_stays_put() {
    let bbox = [10.0, 20.0, 50.0, 80.0];
    let mut filter = MotionFilter::new(&bbox, 0.1, 0.5);
    for _ in 0..5 {
      filter.predict();
      filter.update(&bbox);
    }
    for (a, b) in filter.bbox().iter().zip(bbox) {
      assert!((a - b).abs() < 1e-3);
    }
  }

  #[test]
  fn predict_moves_toward_next_position() {
    let mut filter = MotionFilter::new(&[0.0, 0.0, 10.0, 10.0], 0.1, 0.5);
    for step in 1..=20 {
      let x = step as f32 * 12.0;
      filter.predict();
      filter.update(&[x, 0.0, x + 10.0, 10.0]);
    }
    let before = filter.bbox()[0];
    filter.predict();
    let after = filter.bbox()[0];
    // 下一帧真实位置 x1 = 252
    assert!(after > before);
    assert!((252.0 - after).abs() < (252.0 - before).abs());
    assert!(after < 252.0 + 12.0);
  }
}
