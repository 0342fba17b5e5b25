// 该文件是 Shitu （识图） 项目的一部分。
// src/model/rknn.rs - RKNN NPU 模型
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

use image::imageops::FilterType;
use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  input::ImageFileInput,
  model::{DetectResult, InferenceConfig, Model, RawDetection, labels::COCO_CLASSES},
};

const RKNN_NUM_INPUTS: u32 = 1;
const RKNN_NUM_OUTPUTS: u32 = 6;
const RKNN_CLASS_NUM: usize = COCO_CLASSES.len();
const RKNN_INPUT_W: u32 = 640;
const RKNN_INPUT_H: u32 = 640;
const RKNN_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const RKNN_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];

#[derive(Error, Debug)]
pub enum RknnError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("推理上下文已损坏")]
  ContextPoisoned,
}

impl RknnError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnError::ModelInvalid(msg.to_string(), e)
  }
}

/// 在 RKNN NPU 上运行的三检测头 YOLO 模型（无 NMS 输出）
pub struct Rknn {
  context: Mutex<Context>,
  config: InferenceConfig,
}

pub struct RknnBuilder {
  model_path: PathBuf,
  config: InferenceConfig,
}

impl RknnBuilder {
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

  pub fn build(self) -> Result<Rknn, RknnError> {
    info!("加载模型文件: {}", self.model_path.display());
    let mode_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      mode_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&mode_data, InitFlags::default())?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(RknnError::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| RknnError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| RknnError::invalid("无法获取输出数量", e))?;

    if num_inputs != RKNN_NUM_INPUTS || num_outputs != RKNN_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        RKNN_NUM_INPUTS, RKNN_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(RknnError::invalid(&msg, rknpu::Error::InvalidModel));
    }

    info!("模型加载完成");
    Ok(Rknn {
      context: Mutex::new(context),
      config: self.config,
    })
  }
}

/// 根据张量大小匹配回归和分类输出
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

impl Model for Rknn {
  type Input = ImageFileInput;
  type Output = DetectResult;
  type Error = RknnError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let resized = image::imageops::resize(
      input.image(),
      RKNN_INPUT_W,
      RKNN_INPUT_H,
      FilterType::Triangle,
    );

    let context = self
      .context
      .lock()
      .map_err(|_| RknnError::ContextPoisoned)?;

    debug!("设置模型输入");
    context.set_input(
      0,
      resized.as_raw(),
      TensorFormat::NHWC,
      TensorType::UInt8,
    )?;

    debug!("执行模型推理");
    context.run()?;

    debug!("获取模型输出");
    let output = context.get_outputs()?;

    let heads = (0..RKNN_HEAD_SIZES.len())
      .map(|head| {
        let first = output.get_f32(head * 2).ok()?;
        let second = output.get_f32(head * 2 + 1).ok()?;
        Some((first, second))
      })
      .collect::<Vec<_>>();

    let items = decode_heads(
      &heads,
      self.config.confidence_threshold,
      (input.width() as f32, input.height() as f32),
    );
    debug!("检测到 {} 个物体", items.len());
    Ok(DetectResult::from(items))
  }
}

/// 解码三个检测头，框坐标换算到原图像素
fn decode_heads(
  heads: &[Option<(&[f32], &[f32])>],
  threshold: f32,
  (image_w, image_h): (f32, f32),
) -> Vec<RawDetection> {
  let (input_w, input_h) = (RKNN_INPUT_W as f32, RKNN_INPUT_H as f32);
  let mut items = Vec::new();

  for (head_idx, ((&(map_h, map_w), stride), tensors)) in RKNN_HEAD_SIZES
    .iter()
    .zip(RKNN_STRIDES)
    .zip(heads)
    .enumerate()
  {
    let spatial = map_h * map_w;
    let Some((tensor1, tensor2)) = tensors else {
      error!("检测头 {} 输出缺失", head_idx);
      continue;
    };
    let Some((reg, cls)) = match_reg_cls_tensors(
      tensor1,
      tensor2,
      4 * spatial,
      RKNN_CLASS_NUM * spatial,
    ) else {
      error!(
        "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}",
        head_idx,
        tensor1.len(),
        tensor2.len()
      );
      continue;
    };

    for h in 0..map_h {
      for w in 0..map_w {
        let idx = h * map_w + w;

        let (score, class_id) = {
          let mut max_logit = f32::MIN;
          let mut cls_idx = 0usize;
          for c in 0..RKNN_CLASS_NUM {
            let logit = cls[c * spatial + idx];
            if logit > max_logit {
              max_logit = logit;
              cls_idx = c;
            }
          }
          (sigmoid(max_logit), cls_idx)
        };

        if !(score > threshold) {
          continue;
        }

        let grid_x = (w as f32) + 0.5;
        let grid_y = (h as f32) + 0.5;

        let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, input_w);
        let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, input_h);
        let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, input_w);
        let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, input_h);

        items.push(RawDetection {
          class_id: class_id as u32,
          class_name: COCO_CLASSES[class_id].to_string(),
          confidence: score,
          bbox: [
            xmin / input_w * image_w,
            ymin / input_h * image_h,
            xmax / input_w * image_w,
            ymax / input_h * image_h,
          ],
        });
      }
    }
  }

  items
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
