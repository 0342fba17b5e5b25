// 该文件是 Shitu （识图） 项目的一部分。
// src/input.rs - 图像文件输入
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("文件不存在: {}", .0.display())]
  NotFound(PathBuf),
  #[error("文件为空: {}", .0.display())]
  Empty(PathBuf),
  #[error("不是普通文件: {}", .0.display())]
  NotAFile(PathBuf),
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(image::ImageError),
}

impl From<std::io::Error> for ImageFileInputError {
  fn from(err: std::io::Error) -> Self {
    ImageFileInputError::IoError(err)
  }
}

impl From<image::ImageError> for ImageFileInputError {
  fn from(err: image::ImageError) -> Self {
    ImageFileInputError::ImageLoadError(err)
  }
}

/// 已通过校验并解码的单张图片
#[derive(Debug, Clone)]
pub struct ImageFileInput {
  path: PathBuf,
  file_size: u64,
  image: RgbImage,
}

impl ImageFileInput {
  /// 依次检查文件存在、非空，再按内容（而非扩展名）解码
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();

    let metadata = match std::fs::metadata(path) {
      Ok(metadata) => metadata,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        error!("图片文件不存在: {}", path.display());
        return Err(ImageFileInputError::NotFound(path.to_path_buf()));
      }
      Err(e) => return Err(e.into()),
    };

    if !metadata.is_file() {
      error!("输入路径不是文件: {}", path.display());
      return Err(ImageFileInputError::NotAFile(path.to_path_buf()));
    }

    let file_size = metadata.len();
    info!("图片文件大小: {} 字节", file_size);
    if file_size == 0 {
      error!("图片文件为空: {}", path.display());
      return Err(ImageFileInputError::Empty(path.to_path_buf()));
    }

    let image = ImageReader::open(path)?
      .with_guessed_format()?
      .decode()
      .inspect_err(|e| error!("无法解码图片文件 {}: {}", path.display(), e))?
      .into_rgb8();

    info!("图片尺寸: {}x{}x3", image.width(), image.height());

    Ok(ImageFileInput {
      path: path.to_path_buf(),
      file_size,
      image,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn file_size(&self) -> u64 {
    self.file_size
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }
}
