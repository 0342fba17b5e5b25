// 该文件是 Shitu （识图） 项目的一部分。
// src/model/labels.rs - 类别标签
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

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

pub fn coco_labels() -> Vec<String> {
  COCO_CLASSES.iter().map(|s| s.to_string()).collect()
}

/// 解析 Ultralytics 导出模型中的 `names` 元数据
///
/// 格式形如 `{0: 'person', 1: 'bicycle'}`。编号必须从 0 开始连续，
/// 否则返回 `None`。
pub fn parse_names(raw: &str) -> Option<Vec<String>> {
  let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
  let mut names = Vec::new();
  let mut rest = body.trim();

  while !rest.is_empty() {
    let (id, after_id) = rest.split_once(':')?;
    let id: usize = id.trim().parse().ok()?;
    if id != names.len() {
      return None;
    }

    let after_id = after_id.trim_start();
    let quote = after_id.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let value = &after_id[1..];
    let end = value.find(quote)?;
    names.push(value[..end].to_string());

    rest = value[end + 1..].trim_start();
    rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
  }

  if names.is_empty() { None } else { Some(names) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn coco_table_has_dog_at_sixteen() {
    assert_eq!(COCO_CLASSES.len(), 80);
    assert_eq!(COCO_CLASSES[16], "dog");
    assert_eq!(coco_labels()[0], "person");
  }

  #[test]
  fn parses_ultralytics_names() {
    let names = parse_names("{0: 'person', 1: 'traffic light', 2: \"teddy bear\"}").unwrap();
    assert_eq!(names, vec!["person", "traffic light", "teddy bear"]);
  }

  #[test]
  fn rejects_gaps_and_garbage() {
    assert!(parse_names("{0: 'a', 2: 'b'}").is_none());
    assert!(parse_names("person, car").is_none());
    assert!(parse_names("{}").is_none());
    assert!(parse_names("{0: 'unterminated}").is_none());
  }
}
