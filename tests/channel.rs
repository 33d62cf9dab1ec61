// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/channel.rs - 通道周期的端到端测试
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

mod common;

use std::sync::atomic::Ordering;

use common::*;
use shanan_channel::{
  ChannelError, ChannelSpec, Detection, InferenceFailurePolicy, TrackerConfig,
  tracker::ByteTrackFactory,
};

#[test]
fn single_source_single_model_yields_fixed_box() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("clip", clip(None))
    .model("Default", detection())
    .build()
    .unwrap();

  let results = channel.run().unwrap();
  assert_eq!(results.len(), 1);
  let result = &results[0];
  assert_eq!(result.source_name, "clip");
  assert_eq!(
    result.boxes,
    vec![Detection::new([10.0, 10.0, 50.0, 50.0], 0.9, "person", None)]
  );
  assert_eq!(
    serde_json::to_string(&result.boxes).unwrap(),
    r#"[[10,10,50,50,0.9,"person",null]]"#
  );
  assert!(result.masks.is_empty());
  assert!(result.keypoints.is_empty());
  assert_eq!(result.frame_rate, 30.0);
  assert_eq!(&result.frame[..2], &[0xff, 0xd8]);

  let frame = image::load_from_memory(&result.frame).unwrap();
  assert_eq!((frame.width(), frame.height()), (640, 640));
}

#[test]
fn detection_and_pose_outputs_stay_separate() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("clip", clip(None))
    .model("Default", detection())
    .model("Pose", pose())
    .build()
    .unwrap();

  let results = channel.run().unwrap();
  assert_eq!(results.len(), 1);
  let result = &results[0];
  assert_eq!(result.boxes.len(), 1);
  assert_eq!(result.boxes[0].label, "person");
  assert_eq!(result.keypoints.len(), 2);
  assert_eq!(result.keypoints[0], vec![[100, 120], [110, 130]]);
  assert!(result.masks.is_empty());
  assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn exhausted_source_is_removed() {
  let loader = MockLoader::default();
  let opener = ScriptedOpener::default();
  let mut channel = builder_with(&loader, &opener)
    .source("endless", clip(None))
    .source("short", clip(Some(1)))
    .model("Default", detection())
    .build()
    .unwrap();

  let first = channel.run().unwrap();
  let names: Vec<_> = first.iter().map(|r| r.source_name.as_str()).collect();
  assert_eq!(names, vec!["endless", "short"]);

  let second = channel.run().unwrap();
  assert_eq!(second.len(), 1);
  assert_eq!(second[0].source_name, "endless");
  assert_eq!(channel.source_names(), vec!["endless"]);
  assert_eq!(opener.released(), vec![false, true]);

  let third = channel.run().unwrap();
  assert!(third.iter().all(|r| r.source_name != "short"));
}

#[test]
fn deleted_and_closed_sources_release_their_capture() {
  let loader = MockLoader::default();
  let opener = ScriptedOpener::default();
  let mut channel = builder_with(&loader, &opener)
    .source("a", clip(None))
    .source("b", clip(None))
    .source("c", clip(None))
    .model("Default", detection())
    .build()
    .unwrap();

  channel.run().unwrap();
  channel.delete_source("b").unwrap();
  assert_eq!(opener.released(), vec![false, true, false]);

  channel.close();
  assert_eq!(opener.released(), vec![true, true, true]);
}

/// 检测框 x1 记录的画面颜色，容忍缩放带来的 ±1 误差
fn shade_of(result: &shanan_channel::SourceResult) -> i32 {
  assert_eq!(result.boxes.len(), 1);
  (result.boxes[0].bbox[0] + 5) / 10 * 10
}

#[test]
fn each_source_gets_its_own_batch_slot() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("a", shaded_clip(10, None))
    .source("b", shaded_clip(20, Some(1)))
    .source("c", shaded_clip(30, None))
    .source("d", shaded_clip(40, None))
    .model("Shade", detection())
    .build()
    .unwrap();

  let first = channel.run().unwrap();
  let shades: Vec<_> = first
    .iter()
    .map(|r| (r.source_name.as_str(), shade_of(r)))
    .collect();
  assert_eq!(shades, vec![("a", 10), ("b", 20), ("c", 30), ("d", 40)]);

  // b 结束后，后面的源前移一个位置
  let second = channel.run().unwrap();
  let shades: Vec<_> = second
    .iter()
    .map(|r| (r.source_name.as_str(), shade_of(r)))
    .collect();
  assert_eq!(shades, vec![("a", 10), ("c", 30), ("d", 40)]);
}

#[test]
fn zero_source_cycle_is_empty_and_skips_models() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("a", clip(None))
    .source("b", clip(None))
    .model("Default", detection())
    .build()
    .unwrap();

  channel.delete_source("a").unwrap();
  channel.delete_source("b").unwrap();
  assert!(channel.run().unwrap().is_empty());
  assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn zero_model_cycle_returns_frames_only() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("a", clip(None))
    .model("Default", detection())
    .build()
    .unwrap();

  channel.delete_model("Default").unwrap();
  let results = channel.run().unwrap();
  assert_eq!(results.len(), 1);
  assert!(results[0].boxes.is_empty());
  assert!(!results[0].frame.is_empty());
}

#[test]
fn model_failure_aborts_cycle_by_default() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("a", clip(None))
    .model("Broken", detection())
    .model("Default", detection())
    .build()
    .unwrap();
  assert_eq!(channel.failure_policy(), InferenceFailurePolicy::Abort);

  match channel.run() {
    Err(ChannelError::ModelInference { model, .. }) => assert_eq!(model, "Broken"),
    other => panic!("expected inference failure, got {:?}", other.map(|r| r.len())),
  }
}

#[test]
fn dropped_model_does_not_block_others() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("a", clip(None))
    .model("Broken", detection())
    .model("Default", detection())
    .failure_policy(InferenceFailurePolicy::DropModel)
    .build()
    .unwrap();

  let results = channel.run().unwrap();
  assert_eq!(results.len(), 1);
  assert_eq!(results[0].boxes.len(), 1);
  assert_eq!(results[0].boxes[0].label, "person");
}

#[test]
fn tracker_failure_falls_back_to_untracked_boxes() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("a", clip(None))
    .model("Default", detection())
    .tracker(TrackerConfig::default())
    .tracker_factory(FailingTrackerFactory)
    .build()
    .unwrap();

  let results = channel.run().unwrap();
  assert_eq!(
    results[0].boxes,
    vec![Detection::new([10.0, 10.0, 50.0, 50.0], 0.9, "person", None)]
  );
}

#[test]
fn persistent_box_keeps_its_track_id() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("a", clip(None))
    .model("Default", detection())
    .tracker_factory(ByteTrackFactory)
    .build()
    .unwrap();
  channel.config_tracker(true, false);

  let ids: Vec<_> = (0..4)
    .map(|_| channel.run().unwrap()[0].boxes[0].track_id)
    .collect();
  assert!(ids[0].is_some());
  assert!(ids.iter().all(|id| *id == ids[0]));
}

#[test]
fn realtime_cycles_report_effective_frame_rate() {
  let loader = MockLoader::default();
  let mut channel = builder(&loader)
    .source("a", clip(None))
    .model("Default", detection())
    .build()
    .unwrap();
  channel.configure_inference(0.25, 0.75, true, true).unwrap();

  for _ in 0..3 {
    let results = channel.run().unwrap();
    let rate = results[0].frame_rate;
    assert!(rate > 0.0 && rate <= 30.0);
    let stride = (30.0 / rate).round();
    assert!((30.0 / stride - rate).abs() < 0.01);
  }
}

#[test]
fn open_failure_names_the_source() {
  let loader = MockLoader::default();
  let result = builder(&loader)
    .source("bad", url::Url::parse("rtsp://camera/live").unwrap())
    .model("Default", detection())
    .build();
  assert!(matches!(result, Err(ChannelError::Capture { name, .. }) if name == "bad"));
}

#[test]
fn channel_builds_from_spec() {
  let spec = ChannelSpec::from_json(
    r#"{
      "sources": { "gate": "clip://test", "yard": "clip://test?frames=2" },
      "models": { "Default": { "task": "detection", "weight": "nano" } },
      "inference": { "confidence": 0.5, "realtime": false },
      "tracker": { "enabled": false },
      "failure_policy": "drop_model"
    }"#,
  )
  .unwrap();

  let channel = shanan_channel::ChannelBuilder::from_spec(&spec)
    .opener(ScriptedOpener::default())
    .loader(MockLoader::default())
    .build()
    .unwrap();
  assert_eq!(channel.source_names(), vec!["gate", "yard"]);
  assert_eq!(channel.model_names(), vec!["Default"]);
  assert_eq!(channel.inference_config().confidence, 0.5);
  assert!(!channel.tracker_config().enabled);
  assert_eq!(channel.failure_policy(), InferenceFailurePolicy::DropModel);
  channel.close();
}
