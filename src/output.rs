// 该文件是 Shitu （识图） 项目的一部分。
// src/output.rs - 结果输出
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

use std::io::{self, Write};

use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};
use thiserror::Error;

pub trait Render<T: ?Sized> {
  type Error;
  fn render_result(&mut self, result: &T) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] io::Error),
}

/// 单行、逗号后带空格的 JSON，例如 `["person", "car"]`
#[derive(Debug, Default, Clone, Copy)]
pub struct SpacedFormatter;

impl Formatter for SpacedFormatter {
  fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
  where
    W: ?Sized + Write,
  {
    if first {
      Ok(())
    } else {
      writer.write_all(b", ")
    }
  }

  fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
  where
    W: ?Sized + Write,
  {
    if first {
      Ok(())
    } else {
      writer.write_all(b", ")
    }
  }

  fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
  where
    W: ?Sized + Write,
  {
    writer.write_all(b": ")
  }
}

/// 每个结果输出一行 JSON
pub struct JsonLineOutput<W: Write> {
  writer: W,
}

impl JsonLineOutput<io::Stdout> {
  pub fn stdout() -> Self {
    Self::new(io::stdout())
  }
}

impl<W: Write> JsonLineOutput<W> {
  pub fn new(writer: W) -> Self {
    Self { writer }
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

impl<W: Write, T: Serialize + ?Sized> Render<T> for JsonLineOutput<W> {
  type Error = OutputError;

  fn render_result(&mut self, result: &T) -> Result<(), Self::Error> {
    let mut serializer = Serializer::with_formatter(&mut self.writer, SpacedFormatter);
    result.serialize(&mut serializer)?;
    self.writer.write_all(b"\n")?;
    self.writer.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn render<T: Serialize + ?Sized>(value: &T) -> String {
    let mut output = JsonLineOutput::new(Vec::new());
    output.render_result(value).unwrap();
    String::from_utf8(output.into_inner()).unwrap()
  }

  #[test]
  fn labels_are_one_spaced_line() {
    let labels = vec!["person".to_string(), "car".to_string()];
    assert_eq!(render(&labels), "[\"person\", \"car\"]\n");
  }

  #[test]
  fn empty_result_is_empty_array() {
    assert_eq!(render::<[String]>(&[]), "[]\n");
  }

  #[test]
  fn labels_are_escaped() {
    assert_eq!(render(&["traffic \"light\""]), "[\"traffic \\\"light\\\"\"]\n");
  }
}
