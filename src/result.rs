// 该文件是 Shanan （山南西风） 项目的一部分。
// src/result.rs - 通道输出记录
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

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 一个检测框，坐标为工作分辨率下的整数像素
///
/// 序列化为 `[x1, y1, x2, y2, confidence, label, track_id|null]`。
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub bbox: [i32; 4],
  pub confidence: f32,
  pub label: String,
  pub track_id: Option<u64>,
}

type DetectionTuple = (i32, i32, i32, i32, f32, String, Option<u64>);

impl Detection {
  /// 坐标截断为整数，置信度保留两位小数
  pub fn new(bbox: [f32; 4], confidence: f32, label: impl Into<String>, track_id: Option<u64>) -> Self {
    Self {
      bbox: bbox.map(|v| v as i32),
      confidence: round2(confidence as f64) as f32,
      label: label.into(),
      track_id,
    }
  }
}

impl Serialize for Detection {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let [x1, y1, x2, y2] = self.bbox;
    (x1, y1, x2, y2, self.confidence, &self.label, self.track_id).serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for Detection {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let (x1, y1, x2, y2, confidence, label, track_id) = <DetectionTuple as Deserialize>::deserialize(deserializer)?;
    Ok(Self {
      bbox: [x1, y1, x2, y2],
      confidence,
      label,
      track_id,
    })
  }
}

/// 一路源在一个周期内的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
  pub source_name: String,
  /// JPEG 编码的工作分辨率帧，JSON 中为 base64 字符串
  #[serde(with = "base64_bytes")]
  pub frame: Vec<u8>,
  pub boxes: Vec<Detection>,
  pub masks: Vec<Vec<[i32; 2]>>,
  pub keypoints: Vec<Vec<[i32; 2]>>,
  pub frame_rate: f64,
}

pub(crate) fn round2(value: f64) -> f64 {
  (value * 100.0).round() / 100.0
}

mod base64_bytes {
  use base64::{Engine, engine::general_purpose::STANDARD};
  use serde::{Deserialize, Deserializer, Serializer, de::Error};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    STANDARD.decode(text).map_err(D::Error::custom)
  }
}

impl SourceResult {
  /// 帧的 base64 文本，便于直接嵌入 data URL
  pub fn frame_base64(&self) -> String {
    base64::engine::general_purpose::STANDARD.encode(&self.frame)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detection_serializes_as_flat_array() {
    let detection = Detection::new([10.7, 10.2, 50.0, 50.9], 0.9049, "person", None);
    assert_eq!(detection.bbox, [10, 10, 50, 50]);
    assert_eq!(
      serde_json::to_string(&detection).unwrap(),
      r#"[10,10,50,50,0.9,"person",null]"#
    );

    let tracked = Detection::new([0.0; 4], 0.456, "car", Some(7));
    assert_eq!(
      serde_json::to_value(&tracked).unwrap(),
      serde_json::json!([0, 0, 0, 0, 0.46f32, "car", 7])
    );
  }

  #[test]
  fn frame_is_base64_in_json() {
    let result = SourceResult {
      source_name: "gate".into(),
      frame: vec![0xff, 0xd8, 0xff, 0xd9],
      boxes: vec![],
      masks: vec![vec![[1, 2], [3, 4]]],
      keypoints: vec![],
      frame_rate: 15.0,
    };
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["frame"], "/9j/2Q==");
    assert_eq!(result.frame_base64(), "/9j/2Q==");

    let back: SourceResult = serde_json::from_value(json).unwrap();
    assert_eq!(back, result);
  }
}
