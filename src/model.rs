// 该文件是 Shitu （识图） 项目的一部分。
// src/model.rs - 模型
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
use std::time::Instant;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{debug, info};

use crate::input::ImageFileInput;

#[cfg(not(any(feature = "model_yolov8", feature = "rknpu")))]
compile_error!("至少需要启用一个模型后端特性: model_yolov8 或 rknpu");

pub mod labels;
pub mod source;

#[cfg(feature = "model_yolov8")]
mod yolov8;
#[cfg(feature = "model_yolov8")]
pub use self::yolov8::{Yolov8, Yolov8Builder, Yolov8Error};

#[cfg(feature = "rknpu")]
mod rknn;
#[cfg(feature = "rknpu")]
pub use self::rknn::{Rknn, RknnBuilder, RknnError};

pub use self::source::{LocalModel, ModelKind, ModelSource, ModelSourceError};

/// 推理输入尺寸
pub const INPUT_SIZE: u32 = 320;
/// 置信度阈值，严格大于才保留
pub const CONFIDENCE_THRESHOLD: f32 = 0.3;
/// NMS IOU 阈值
pub const IOU_THRESHOLD: f32 = 0.7;
/// 单张图片最多保留的检测数
pub const MAX_DETECTIONS: usize = 300;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 模型输出的一条原始检测
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
  pub class_id: u32,
  pub class_name: String,
  pub confidence: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，原图像素坐标
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[RawDetection]>,
}

impl From<Vec<RawDetection>> for DetectResult {
  fn from(items: Vec<RawDetection>) -> Self {
    DetectResult {
      items: items.into_boxed_slice(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
  pub input_size: u32,
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
  pub max_detections: usize,
}

impl Default for InferenceConfig {
  fn default() -> Self {
    Self {
      input_size: INPUT_SIZE,
      confidence_threshold: CONFIDENCE_THRESHOLD,
      iou_threshold: IOU_THRESHOLD,
      max_detections: MAX_DETECTIONS,
    }
  }
}

/// 延迟构建模型
pub trait ModelBuilder {
  type Model;
  type Error;

  fn build(&self) -> Result<Self::Model, Self::Error>;
}

impl<F, M, E> ModelBuilder for F
where
  F: Fn() -> Result<M, E>,
{
  type Model = M;
  type Error = E;

  fn build(&self) -> Result<M, E> {
    self()
  }
}

/// 进程内共享的模型
///
/// 首次 `get` 时构建，之后只读。并发首次访问时只有一个线程执行构建，
/// 其余线程等待其结果。构建失败不会被缓存，下一次 `get` 会重新尝试。
pub struct SharedModel<B: ModelBuilder> {
  builder: B,
  cell: OnceCell<B::Model>,
}

impl<B: ModelBuilder> SharedModel<B> {
  pub fn new(builder: B) -> Self {
    Self {
      builder,
      cell: OnceCell::new(),
    }
  }

  pub fn get(&self) -> Result<&B::Model, B::Error> {
    self.cell.get_or_try_init(|| {
      info!("加载模型...");
      let now = Instant::now();
      let model = self.builder.build()?;
      info!("模型加载完成，耗时: {:.2?}", now.elapsed());
      Ok(model)
    })
  }

  pub fn is_initialized(&self) -> bool {
    self.cell.get().is_some()
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型来源错误: {0}")]
  Source(#[from] ModelSourceError),
  #[cfg(feature = "model_yolov8")]
  #[error("YOLOv8 模型错误: {0}")]
  Yolov8(#[from] Yolov8Error),
  #[cfg(feature = "rknpu")]
  #[error("RKNN 模型错误: {0}")]
  Rknn(#[from] RknnError),
  #[error("未启用 {0} 模型后端")]
  BackendDisabled(ModelKind),
}

pub enum ModelWrapper {
  #[cfg(feature = "model_yolov8")]
  Yolov8(Yolov8),
  #[cfg(feature = "rknpu")]
  Rknn(Rknn),
}

impl Model for ModelWrapper {
  type Input = ImageFileInput;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    match self {
      #[cfg(feature = "model_yolov8")]
      ModelWrapper::Yolov8(model) => model.infer(input).map_err(ModelError::from),
      #[cfg(feature = "rknpu")]
      ModelWrapper::Rknn(model) => model.infer(input).map_err(ModelError::from),
    }
  }
}

/// 默认的模型缓存目录
pub fn default_model_dir() -> PathBuf {
  dirs::cache_dir()
    .map(|mut p| {
      p.push("shitu");
      p.push("models");
      p
    })
    .unwrap_or_else(|| PathBuf::from("./models"))
}

#[derive(Debug, Clone)]
pub struct ModelWrapperBuilder {
  source: ModelSource,
  model_dir: PathBuf,
  config: InferenceConfig,
}

impl ModelWrapperBuilder {
  pub fn new(source: ModelSource) -> Self {
    Self {
      source,
      model_dir: default_model_dir(),
      config: InferenceConfig::default(),
    }
  }

  pub fn model_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
    self.model_dir = dir.as_ref().to_path_buf();
    self
  }

  pub fn config(mut self, config: InferenceConfig) -> Self {
    self.config = config;
    self
  }
}

impl ModelBuilder for ModelWrapperBuilder {
  type Model = ModelWrapper;
  type Error = ModelError;

  fn build(&self) -> Result<ModelWrapper, ModelError> {
    let local = self.source.fetch(&self.model_dir)?;
    debug!("模型文件: {} ({})", local.path.display(), local.kind);

    match local.kind {
      #[cfg(feature = "model_yolov8")]
      ModelKind::Onnx => {
        let model = Yolov8Builder::new(&local.path)
          .config(self.config.clone())
          .build()?;
        Ok(ModelWrapper::Yolov8(model))
      }
      #[cfg(feature = "rknpu")]
      ModelKind::Rknn => {
        let model = RknnBuilder::new(&local.path)
          .config(self.config.clone())
          .build()?;
        Ok(ModelWrapper::Rknn(model))
      }
      #[allow(unreachable_patterns)]
      kind => Err(ModelError::BackendDisabled(kind)),
    }
  }
}
