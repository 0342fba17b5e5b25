// 该文件是 Shitu （识图） 项目的一部分。
// src/task.rs - 单张图片分析任务
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

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::{debug, error, info};

use crate::{
  error::{AnalyzeError, BoxError},
  input::ImageFileInput,
  model::{
    CONFIDENCE_THRESHOLD, DetectResult, Model, ModelBuilder, ModelSource, ModelSourceError,
    ModelWrapperBuilder, SharedModel, source::DEFAULT_MODEL_URL,
  },
};

/// 进程内共享的默认模型，首次分析时才加载
static DEFAULT_MODEL: Lazy<Result<SharedModel<ModelWrapperBuilder>, ModelSourceError>> =
  Lazy::new(|| {
    ModelSource::parse(DEFAULT_MODEL_URL)
      .map(|source| SharedModel::new(ModelWrapperBuilder::new(source)))
  });

/// 一次成功分析的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
  /// 去重后的类别名，按首次出现顺序排列
  pub labels: Vec<String>,
  /// 通过阈值过滤的原始检测数（含重复类别）
  pub total_detections: usize,
  pub width: u32,
  pub height: u32,
}

/// 校验 → 解码 → 推理 → 过滤 → 聚合
pub struct AnalyzeTask<'a, B: ModelBuilder> {
  model: &'a SharedModel<B>,
  confidence_threshold: f32,
}

impl<'a, B, M> AnalyzeTask<'a, B>
where
  B: ModelBuilder<Model = M>,
  B::Error: Into<BoxError>,
  M: Model<Input = ImageFileInput, Output = DetectResult>,
  M::Error: Into<BoxError>,
{
  pub fn new(model: &'a SharedModel<B>) -> Self {
    Self {
      model,
      confidence_threshold: CONFIDENCE_THRESHOLD,
    }
  }

  pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn try_run<P: AsRef<Path>>(&self, path: P) -> Result<Analysis, AnalyzeError> {
    info!("开始任务...");
    let input = ImageFileInput::open(path.as_ref())?;

    let model = self.model.get().map_err(AnalyzeError::model_init)?;

    info!("图片读取成功: {}，开始推理...", input.path().display());
    let now = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| model.infer(&input)))
      .map_err(|payload| AnalyzeError::inference(panic_message(payload)))?
      .map_err(AnalyzeError::inference)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    Ok(self.aggregate(&input, &result))
  }

  /// 失败时返回空列表
  pub fn run<P: AsRef<Path>>(&self, path: P) -> Vec<String> {
    match self.try_run(path) {
      Ok(analysis) => analysis.labels,
      Err(err) => {
        log_failure(&err);
        Vec::new()
      }
    }
  }

  fn aggregate(&self, input: &ImageFileInput, result: &DetectResult) -> Analysis {
    debug!("模型返回 {} 个检测", result.items.len());
    let mut seen = HashSet::new();
    let mut labels = Vec::new();
    let mut total_detections = 0;

    for item in result.items.iter() {
      if !(item.confidence > self.confidence_threshold) {
        debug!(
          "忽略: {} (置信度: {:.2})",
          item.class_name, item.confidence
        );
        continue;
      }
      total_detections += 1;
      info!("检测到: {} (置信度: {:.2})", item.class_name, item.confidence);
      if seen.insert(item.class_name.as_str()) {
        labels.push(item.class_name.clone());
      }
    }

    info!(
      "分析完成: {} 个类别，共 {} 个检测",
      labels.len(),
      total_detections
    );

    Analysis {
      labels,
      total_detections,
      width: input.width(),
      height: input.height(),
    }
  }
}

/// 使用默认阈值分析一张图片，任何失败都返回空列表
pub fn analyze<B, M, P>(model: &SharedModel<B>, path: P) -> Vec<String>
where
  B: ModelBuilder<Model = M>,
  B::Error: Into<BoxError>,
  M: Model<Input = ImageFileInput, Output = DetectResult>,
  M::Error: Into<BoxError>,
  P: AsRef<Path>,
{
  AnalyzeTask::new(model).run(path)
}

/// 使用进程内共享的默认模型分析一张图片，任何失败都返回空列表
pub fn analyze_path<P: AsRef<Path>>(path: P) -> Vec<String> {
  match &*DEFAULT_MODEL {
    Ok(model) => analyze(model, path),
    Err(err) => {
      log_failure(&AnalyzeError::model_init(err.to_string()));
      Vec::new()
    }
  }
}

/// 记录失败原因，各层错误信息已包含其下层原因
pub fn log_failure(err: &AnalyzeError) {
  error!("分析失败: {}", err);
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    format!("推理过程崩溃: {}", msg)
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    format!("推理过程崩溃: {}", msg)
  } else {
    String::from("推理过程崩溃")
  }
}
