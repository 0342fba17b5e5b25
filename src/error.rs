// 该文件是 Shitu （识图） 项目的一部分。
// src/error.rs - 分析流程错误定义
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

use thiserror::Error;

use crate::input::ImageFileInputError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 单次分析可能出现的全部失败类型
///
/// 对外接口只暴露 “成功或空结果”，这里保留具体原因用于日志与测试。
#[derive(Error, Debug)]
pub enum AnalyzeError {
  #[error("图片文件不存在: {}", .0.display())]
  InputNotFound(PathBuf),
  #[error("图片文件为空: {}", .0.display())]
  InputEmpty(PathBuf),
  #[error("图片解码失败: {0}")]
  DecodeFailure(#[source] ImageFileInputError),
  #[error("模型初始化失败: {0}")]
  ModelInit(#[source] BoxError),
  #[error("推理失败: {0}")]
  Inference(#[source] BoxError),
}

impl From<ImageFileInputError> for AnalyzeError {
  fn from(err: ImageFileInputError) -> Self {
    match err {
      ImageFileInputError::NotFound(path) => AnalyzeError::InputNotFound(path),
      ImageFileInputError::Empty(path) => AnalyzeError::InputEmpty(path),
      other => AnalyzeError::DecodeFailure(other),
    }
  }
}

impl AnalyzeError {
  pub fn model_init<E>(err: E) -> Self
  where
    E: Into<BoxError>,
  {
    AnalyzeError::ModelInit(err.into())
  }

  pub fn inference<E>(err: E) -> Self
  where
    E: Into<BoxError>,
  {
    AnalyzeError::Inference(err.into())
  }

  /// 模型初始化失败与 “没有检测到物体” 在运维上含义不同，调用方可据此区分
  pub fn is_model_init(&self) -> bool {
    matches!(self, AnalyzeError::ModelInit(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn input_errors_keep_their_kind() {
    let err: AnalyzeError = ImageFileInputError::NotFound(PathBuf::from("a.jpg")).into();
    assert!(matches!(err, AnalyzeError::InputNotFound(_)));

    let err: AnalyzeError = ImageFileInputError::Empty(PathBuf::from("a.jpg")).into();
    assert!(matches!(err, AnalyzeError::InputEmpty(_)));

    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: AnalyzeError = ImageFileInputError::IoError(io).into();
    assert!(matches!(err, AnalyzeError::DecodeFailure(_)));
  }

  #[test]
  fn only_init_failures_report_model_init() {
    assert!(AnalyzeError::model_init("no artifact").is_model_init());
    assert!(!AnalyzeError::inference("bad output").is_model_init());
    assert!(!AnalyzeError::InputEmpty(PathBuf::from("x")).is_model_init());
  }
}
