// 该文件是 Shitu （识图） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 ONNX 模型
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
use std::sync::Mutex;

use image::{RgbImage, imageops::FilterType};
use ndarray::Array4;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::{TensorRef, ValueType},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  input::ImageFileInput,
  model::{DetectResult, InferenceConfig, Model, RawDetection, labels},
};

const YOLOV8_BOX_CHANNELS: usize = 4;
const YOLOV8_PAD_VALUE: f32 = 114.0 / 255.0;
const YOLOV8_INTRA_THREADS: usize = 4;

#[derive(Error, Debug)]
pub enum Yolov8Error {
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(#[from] ort::Error),
  #[error("模型缺少{0}张量")]
  MissingTensor(&'static str),
  #[error("模型输出形状异常: {0:?}, 类别数 {1}")]
  BadOutputShape(Vec<usize>, usize),
  #[error("推理会话已损坏")]
  SessionPoisoned,
}

pub struct Yolov8 {
  session: Mutex<Session>,
  input_size: u32,
  input_name: String,
  output_name: String,
  labels: Vec<String>,
  config: InferenceConfig,
}

pub struct Yolov8Builder {
  model_path: PathBuf,
  config: InferenceConfig,
}

impl Yolov8Builder {
  pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      config: InferenceConfig::default(),
    }
  }

  pub fn config(mut self, config: InferenceConfig) -> Self {
    self.config = config;
    self
  }

  pub fn build(self) -> Result<Yolov8, Yolov8Error> {
    info!("加载模型文件: {}", self.model_path.display());

    // 重复调用是幂等的
    let _ = ort::init().commit();

    let session = Session::builder()?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .with_intra_threads(YOLOV8_INTRA_THREADS)?
      .commit_from_file(&self.model_path)?;

    let input = session
      .inputs
      .first()
      .ok_or(Yolov8Error::MissingTensor("输入"))?;
    let input_name = input.name.clone();
    let input_dims = match &input.input_type {
      ValueType::Tensor { shape, .. } => shape.iter().copied().collect::<Vec<i64>>(),
      _ => Vec::new(),
    };
    let output_name = session
      .outputs
      .first()
      .map(|o| o.name.clone())
      .ok_or(Yolov8Error::MissingTensor("输出"))?;
    debug!(
      "模型输入: {} {:?}, 模型输出: {}",
      input_name, input_dims, output_name
    );

    let input_size = resolve_input_size(&input_dims, self.config.input_size);
    info!("推理输入尺寸: {}x{}", input_size, input_size);

    let labels = match session.metadata() {
      Ok(metadata) => match metadata.custom("names") {
        Ok(Some(raw)) => labels::parse_names(&raw),
        _ => None,
      },
      Err(e) => {
        warn!("读取模型元数据失败: {}", e);
        None
      }
    };
    let labels = labels.unwrap_or_else(|| {
      debug!("模型未携带类别名称，使用 COCO 类别表");
      labels::coco_labels()
    });
    debug!("类别数量: {}", labels.len());

    info!("模型加载完成");
    Ok(Yolov8 {
      session: Mutex::new(session),
      input_size,
      input_name,
      output_name,
      labels,
      config: self.config,
    })
  }
}

impl Model for Yolov8 {
  type Input = ImageFileInput;
  type Output = DetectResult;
  type Error = Yolov8Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("预处理输入图像");
    let (tensor, letterbox) = letterbox(input.image(), self.input_size);
    let tensor = tensor.as_standard_layout();

    let mut session = self
      .session
      .lock()
      .map_err(|_| Yolov8Error::SessionPoisoned)?;

    debug!("执行模型推理");
    let outputs = session.run(ort::inputs![
      self.input_name.as_str() => TensorRef::from_array_view(&tensor)?
    ])?;

    debug!("获取模型输出");
    let output = outputs
      .get(self.output_name.as_str())
      .ok_or(Yolov8Error::MissingTensor("输出"))?;
    let (shape, data) = output.try_extract_tensor::<f32>()?;
    let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();

    let candidates = decode(&shape, data, &letterbox, &self.labels, &self.config)?;
    let items = non_max_suppression(
      candidates,
      self.config.iou_threshold,
      self.config.max_detections,
    );

    debug!("检测到 {} 个物体", items.len());
    Ok(DetectResult::from(items))
  }
}

/// 选择实际的推理尺寸
///
/// `dims` 为模型声明的输入形状 `[N, C, H, W]`，非正数表示动态维度。
/// 动态输入使用配置尺寸；固定的正方形输入只能使用模型自身的尺寸。
pub(crate) fn resolve_input_size(dims: &[i64], configured: u32) -> u32 {
  let [_, _, h, w] = dims else {
    return configured;
  };
  match (*h, *w) {
    (h, w) if h <= 0 || w <= 0 => configured,
    (h, w) if h == w => {
      let fixed = h as u32;
      if fixed != configured {
        warn!(
          "模型输入尺寸固定为 {}x{}，忽略配置的输入尺寸 {}",
          fixed, fixed, configured
        );
      }
      fixed
    }
    (h, w) => {
      warn!("不支持非正方形的固定输入 {}x{}，使用配置尺寸 {}", w, h, configured);
      configured
    }
  }
}

/// 等比缩放并居中填充后的几何参数，用于把框映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Letterbox {
  scale: f32,
  pad_x: f32,
  pad_y: f32,
  width: f32,
  height: f32,
}

impl Letterbox {
  fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
    (
      ((x - self.pad_x) / self.scale).clamp(0.0, self.width),
      ((y - self.pad_y) / self.scale).clamp(0.0, self.height),
    )
  }
}

/// RGB 图像 -> [1, 3, size, size]，取值 0~1，灰色填充
pub(crate) fn letterbox(image: &RgbImage, size: u32) -> (Array4<f32>, Letterbox) {
  let (width, height) = image.dimensions();
  let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
  let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
  let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
  let pad_x = (size - new_w) / 2;
  let pad_y = (size - new_h) / 2;

  let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

  let side = size as usize;
  let mut tensor = Array4::from_elem((1, 3, side, side), YOLOV8_PAD_VALUE);
  for (x, y, pixel) in resized.enumerate_pixels() {
    let (row, col) = ((y + pad_y) as usize, (x + pad_x) as usize);
    for c in 0..3 {
      tensor[[0, c, row, col]] = pixel[c] as f32 / 255.0;
    }
  }

  let geometry = Letterbox {
    scale,
    pad_x: pad_x as f32,
    pad_y: pad_y as f32,
    width: width as f32,
    height: height as f32,
  };
  (tensor, geometry)
}

/// 解析 `[1, 4 + nc, anchors]`（或转置后的 `[1, anchors, 4 + nc]`）输出
pub(crate) fn decode(
  shape: &[usize],
  data: &[f32],
  letterbox: &Letterbox,
  labels: &[String],
  config: &InferenceConfig,
) -> Result<Vec<RawDetection>, Yolov8Error> {
  let num_classes = labels.len();
  let channels = YOLOV8_BOX_CHANNELS + num_classes;
  let bad_shape = || Yolov8Error::BadOutputShape(shape.to_vec(), num_classes);

  let (anchors, transposed) = match shape {
    [1, c, a] if *c == channels => (*a, false),
    [1, a, c] if *c == channels => (*a, true),
    _ => {
      error!("模型输出形状 {:?} 与类别数 {} 不匹配", shape, num_classes);
      return Err(bad_shape());
    }
  };
  if data.len() != anchors * channels {
    return Err(bad_shape());
  }

  let at = |channel: usize, anchor: usize| {
    if transposed {
      data[anchor * channels + channel]
    } else {
      data[channel * anchors + anchor]
    }
  };

  let mut items = Vec::new();
  for anchor in 0..anchors {
    let (class_id, score) = (0..num_classes)
      .map(|c| (c, at(YOLOV8_BOX_CHANNELS + c, anchor)))
      .fold((0usize, f32::MIN), |best, cur| {
        if cur.1 > best.1 { cur } else { best }
      });

    if !(score > config.confidence_threshold) {
      continue;
    }

    let (cx, cy) = (at(0, anchor), at(1, anchor));
    let (w, h) = (at(2, anchor), at(3, anchor));
    let (x_min, y_min) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
    let (x_max, y_max) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);

    items.push(RawDetection {
      class_id: class_id as u32,
      class_name: labels[class_id].clone(),
      confidence: score,
      bbox: [x_min, y_min, x_max, y_max],
    });
  }

  debug!("阈值过滤后候选框: {}", items.len());
  Ok(items)
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = inter_w * inter_h;
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 按类别进行的贪心 NMS，结果按置信度降序
pub(crate) fn non_max_suppression(
  mut candidates: Vec<RawDetection>,
  iou_threshold: f32,
  max_detections: usize,
) -> Vec<RawDetection> {
  candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut keep: Vec<RawDetection> = Vec::new();
  for candidate in candidates {
    if keep.len() >= max_detections {
      break;
    }
    let suppressed = keep.iter().any(|kept| {
      kept.class_id == candidate.class_id && iou(&kept.bbox, &candidate.bbox) > iou_threshold
    });
    if !suppressed {
      keep.push(candidate);
    }
  }
  keep
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn detection(class_id: u32, confidence: f32, bbox: [f32; 4]) -> RawDetection {
    RawDetection {
      class_id,
      class_name: labels::COCO_CLASSES[class_id as usize].to_string(),
      confidence,
      bbox,
    }
  }

  #[test]
  fn fixed_model_input_overrides_configured_size() {
    assert_eq!(resolve_input_size(&[1, 3, 640, 640], 320), 640);
    assert_eq!(resolve_input_size(&[1, 3, 320, 320], 320), 320);
  }

  #[test]
  fn dynamic_model_input_uses_configured_size() {
    assert_eq!(resolve_input_size(&[-1, 3, -1, -1], 320), 320);
    assert_eq!(resolve_input_size(&[1, 3, 0, 0], 416), 416);
    assert_eq!(resolve_input_size(&[], 320), 320);
    assert_eq!(resolve_input_size(&[1, 3, 480, 640], 320), 320);
  }

  #[test]
  fn letterbox_pads_the_short_side() {
    let image = RgbImage::from_pixel(640, 320, Rgb([255, 0, 0]));
    let (tensor, geometry) = letterbox(&image, 320);

    assert_eq!(tensor.shape(), &[1, 3, 320, 320]);
    assert_eq!(geometry.scale, 0.5);
    assert_eq!((geometry.pad_x, geometry.pad_y), (0.0, 80.0));
    assert_eq!(tensor[[0, 0, 0, 0]], YOLOV8_PAD_VALUE);
    assert_eq!(tensor[[0, 0, 160, 160]], 1.0);
    assert_eq!(tensor[[0, 1, 160, 160]], 0.0);
  }

  #[test]
  fn decode_maps_boxes_back_to_source_pixels() {
    let labels = vec!["cat".to_string(), "dog".to_string()];
    let geometry = Letterbox {
      scale: 0.5,
      pad_x: 0.0,
      pad_y: 80.0,
      width: 640.0,
      height: 320.0,
    };
    // 通道优先布局：[cx, cy, w, h, cat, dog] x 2 个锚点
    let data = vec![
      160.0, 10.0, // cx
      160.0, 10.0, // cy
      100.0, 4.0, // w
      50.0, 4.0, // h
      0.1, 0.2, // cat
      0.9, 0.25, // dog
    ];
    let items = decode(&[1, 6, 2], &data, &geometry, &labels, &InferenceConfig::default()).unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_name, "dog");
    assert_eq!(items[0].bbox, [220.0, 110.0, 420.0, 210.0]);
  }

  #[test]
  fn decode_threshold_is_strict() {
    let labels = vec!["person".to_string()];
    let geometry = Letterbox {
      scale: 1.0,
      pad_x: 0.0,
      pad_y: 0.0,
      width: 320.0,
      height: 320.0,
    };
    let data = vec![10.0, 10.0, 10.0, 10.0, 0.3];
    let items = decode(&[1, 5, 1], &data, &geometry, &labels, &InferenceConfig::default()).unwrap();
    assert!(items.is_empty());
  }

  #[test]
  fn decode_rejects_mismatched_shapes() {
    let labels = labels::coco_labels();
    let geometry = Letterbox {
      scale: 1.0,
      pad_x: 0.0,
      pad_y: 0.0,
      width: 1.0,
      height: 1.0,
    };
    let err = decode(&[1, 6, 2], &[0.0; 12], &geometry, &labels, &InferenceConfig::default());
    assert!(matches!(err, Err(Yolov8Error::BadOutputShape(_, 80))));
  }

  #[test]
  fn nms_is_class_aware() {
    let kept = non_max_suppression(
      vec![
        detection(0, 0.6, [0.0, 0.0, 10.0, 10.0]),
        detection(0, 0.9, [0.5, 0.5, 10.5, 10.5]),
        detection(16, 0.5, [0.0, 0.0, 10.0, 10.0]),
        detection(0, 0.4, [50.0, 50.0, 60.0, 60.0]),
      ],
      0.7,
      300,
    );

    let summary: Vec<(u32, f32)> = kept.iter().map(|d| (d.class_id, d.confidence)).collect();
    assert_eq!(summary, vec![(0, 0.9), (16, 0.5), (0, 0.4)]);
  }

  #[test]
  fn nms_honours_max_detections() {
    let candidates = (0..10)
      .map(|i| detection(0, 0.5, [i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0]))
      .collect();
    assert_eq!(non_max_suppression(candidates, 0.7, 3).len(), 3);
  }
}
