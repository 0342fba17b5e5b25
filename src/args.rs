// 该文件是 Shitu （识图） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use clap::Parser;

use shitu::model::{
  CONFIDENCE_THRESHOLD, INPUT_SIZE, IOU_THRESHOLD, InferenceConfig, ModelSource,
  source::DEFAULT_MODEL_URL,
};

/// 识别单张图片中的物体类别，以 JSON 数组输出到标准输出
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 待分析的图片文件路径
  #[arg(value_name = "IMAGE")]
  pub image: PathBuf,

  /// 模型来源
  /// 支持格式:
  /// - 本地文件: *.onnx, *.rknn
  /// - onnx:///path/to/model.onnx, rknn:///path/to/model.rknn
  /// - http(s)://.../model.onnx（首次使用时下载到模型目录）
  #[arg(
    long,
    env = "SHITU_MODEL",
    value_name = "URL",
    default_value = DEFAULT_MODEL_URL,
    value_parser = ModelSource::parse,
  )]
  pub model: ModelSource,

  /// 模型下载缓存目录
  #[arg(long, env = "SHITU_MODEL_DIR", value_name = "DIR")]
  pub model_dir: Option<PathBuf>,

  /// 推理输入尺寸
  #[arg(
    long,
    env = "SHITU_INPUT_SIZE",
    value_name = "PIXELS",
    default_value_t = INPUT_SIZE,
    value_parser = clap::value_parser!(u32).range(32..=4096),
  )]
  pub input_size: u32,

  /// 置信度阈值 (0.0 - 1.0)，严格大于才保留
  #[arg(
    long,
    env = "SHITU_CONFIDENCE",
    value_name = "THRESHOLD",
    default_value_t = CONFIDENCE_THRESHOLD,
    value_parser = parse_unit_interval,
  )]
  pub confidence: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(
    long,
    env = "SHITU_IOU",
    value_name = "THRESHOLD",
    default_value_t = IOU_THRESHOLD,
    value_parser = parse_unit_interval,
  )]
  pub iou: f32,

  /// 模型初始化失败时以状态码 3 退出，而不是输出空数组
  #[arg(long, env = "SHITU_STRICT")]
  pub strict: bool,
}

impl Args {
  pub fn inference_config(&self) -> InferenceConfig {
    InferenceConfig {
      input_size: self.input_size,
      confidence_threshold: self.confidence,
      iou_threshold: self.iou,
      ..InferenceConfig::default()
    }
  }
}

fn parse_unit_interval(s: &str) -> Result<f32, String> {
  let value: f32 = s.parse().map_err(|e| format!("{}: {}", s, e))?;
  if (0.0..=1.0).contains(&value) {
    Ok(value)
  } else {
    Err(format!("{} 不在 0.0 - 1.0 范围内", value))
  }
}
