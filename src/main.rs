// 该文件是 Shitu （识图） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, error::ErrorKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shitu::{
  AnalyzeTask,
  model::{ModelWrapperBuilder, SharedModel},
  output::{JsonLineOutput, Render},
  task::log_failure,
};

use args::Args;

const EXIT_USAGE: u8 = 1;
const EXIT_OUTPUT: u8 = 2;
const EXIT_MODEL_INIT: u8 = 3;

fn main() -> ExitCode {
  let args = match Args::try_parse() {
    Ok(args) => args,
    Err(e) => {
      let _ = e.print();
      return match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_USAGE),
      };
    }
  };

  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  match run(args) {
    Ok(code) => code,
    Err(e) => {
      error!("{:#}", e);
      ExitCode::from(EXIT_OUTPUT)
    }
  }
}

fn run(args: Args) -> Result<ExitCode> {
  info!("图片路径: {}", args.image.display());
  info!("模型来源: {}", args.model);

  let mut builder = ModelWrapperBuilder::new(args.model.clone()).config(args.inference_config());
  if let Some(dir) = &args.model_dir {
    builder = builder.model_dir(dir);
  }
  let model = SharedModel::new(builder);

  let task = AnalyzeTask::new(&model).with_confidence_threshold(args.confidence);
  let labels = match task.try_run(&args.image) {
    Ok(analysis) => analysis.labels,
    Err(err) => {
      log_failure(&err);
      if args.strict && err.is_model_init() {
        return Ok(ExitCode::from(EXIT_MODEL_INIT));
      }
      Vec::new()
    }
  };

  JsonLineOutput::stdout()
    .render_result(&labels)
    .context("写出结果失败")?;

  Ok(ExitCode::SUCCESS)
}
