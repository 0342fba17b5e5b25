// 该文件是 Shitu （识图） 项目的一部分。
// src/model/source.rs - 模型文件来源与下载
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

use std::fmt;
use std::fs;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use reqwest::blocking::{Client, Response};
use url::Url;

use crate::FromUrl;

/// 默认模型：Ultralytics 发布的 YOLOv8n ONNX 文件
pub const DEFAULT_MODEL_URL: &str =
  "https://github.com/ultralytics/assets/releases/download/v8.2.0/yolov8n.onnx";

const ONNX_SCHEME: &str = "onnx";
const RKNN_SCHEME: &str = "rknn";

const DOWNLOAD_TIMEOUT_SECS: u64 = 600;
const MIN_MODEL_SIZE: u64 = 1024;
const MAX_MODEL_SIZE: u64 = 2_000_000_000;
const MODEL_SIZE_RANGE: RangeInclusive<u64> = MIN_MODEL_SIZE..=MAX_MODEL_SIZE;

#[derive(Error, Debug)]
pub enum ModelSourceError {
  #[error("不支持的模型 URI 方案: {0}")]
  UnsupportedScheme(String),
  #[error("无法识别的模型格式: {0}")]
  UnknownFormat(String),
  #[error("无效的模型路径: {0}")]
  InvalidPath(String),
  #[error("模型文件不存在: {}", .0.display())]
  NotFound(PathBuf),
  #[error("下载失败: HTTP {0}")]
  HttpStatus(u16),
  #[error("模型文件大小异常: {0} 字节")]
  BadSize(u64),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("网络错误: {0}")]
  NetworkError(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
  Onnx,
  Rknn,
}

impl fmt::Display for ModelKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelKind::Onnx => write!(f, "onnx"),
      ModelKind::Rknn => write!(f, "rknn"),
    }
  }
}

impl ModelKind {
  fn from_file_name(name: &str) -> Result<Self, ModelSourceError> {
    let lower = name.to_lowercase();
    if lower.ends_with(".onnx") {
      Ok(ModelKind::Onnx)
    } else if lower.ends_with(".rknn") {
      Ok(ModelKind::Rknn)
    } else {
      Err(ModelSourceError::UnknownFormat(name.to_string()))
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
  Local(PathBuf),
  Remote(Url),
}

/// 模型文件来源：本地文件，或首次使用时下载到模型目录的远程文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
  location: Location,
  kind: ModelKind,
}

/// 已经位于本地磁盘的模型文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModel {
  pub path: PathBuf,
  pub kind: ModelKind,
}

impl FromUrl for ModelSource {
  type Error = ModelSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ONNX_SCHEME | RKNN_SCHEME => {
        let path = urlencoding::decode(url.path())
          .map_err(|_| ModelSourceError::InvalidPath(url.to_string()))?
          .into_owned();
        if path.is_empty() {
          return Err(ModelSourceError::InvalidPath(url.to_string()));
        }
        let kind = if url.scheme() == ONNX_SCHEME {
          ModelKind::Onnx
        } else {
          ModelKind::Rknn
        };
        Ok(ModelSource {
          location: Location::Local(PathBuf::from(path)),
          kind,
        })
      }
      "file" => {
        let path = url
          .to_file_path()
          .map_err(|_| ModelSourceError::InvalidPath(url.to_string()))?;
        ModelSource::from_path(path)
      }
      "http" | "https" => {
        let name = file_name_of(url)?;
        Ok(ModelSource {
          kind: ModelKind::from_file_name(&name)?,
          location: Location::Remote(url.clone()),
        })
      }
      other => Err(ModelSourceError::UnsupportedScheme(other.to_string())),
    }
  }
}

impl ModelSource {
  /// 接受 URI 或普通文件路径
  pub fn parse(s: &str) -> Result<Self, ModelSourceError> {
    match Url::parse(s) {
      // 单字母方案视为 Windows 盘符
      Ok(url) if url.scheme().len() > 1 => ModelSource::from_url(&url),
      Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => ModelSource::from_path(s),
      Err(_) => Err(ModelSourceError::InvalidPath(s.to_string())),
    }
  }

  pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ModelSourceError> {
    let path = path.as_ref();
    let name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| ModelSourceError::InvalidPath(path.display().to_string()))?;
    Ok(ModelSource {
      kind: ModelKind::from_file_name(name)?,
      location: Location::Local(path.to_path_buf()),
    })
  }

  pub fn kind(&self) -> ModelKind {
    self.kind
  }

  pub fn is_remote(&self) -> bool {
    matches!(self.location, Location::Remote(_))
  }

  /// 确保模型文件在本地可用，远程来源会下载到 `model_dir`
  pub fn fetch(&self, model_dir: &Path) -> Result<LocalModel, ModelSourceError> {
    self.fetch_with(model_dir, download_client)
  }

  /// 同 `fetch`，只在需要下载时才调用 `client` 构造 HTTP 客户端
  pub fn fetch_with<F>(&self, model_dir: &Path, client: F) -> Result<LocalModel, ModelSourceError>
  where
    F: FnOnce() -> Result<Client, ModelSourceError>,
  {
    let path = match &self.location {
      Location::Local(path) => {
        if !path.is_file() {
          return Err(ModelSourceError::NotFound(path.clone()));
        }
        path.clone()
      }
      Location::Remote(url) => ensure_downloaded(url, model_dir, client)?,
    };

    Ok(LocalModel {
      path,
      kind: self.kind,
    })
  }
}

impl fmt::Display for ModelSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.location {
      Location::Local(path) => write!(f, "{}", path.display()),
      Location::Remote(url) => write!(f, "{}", url),
    }
  }
}

fn file_name_of(url: &Url) -> Result<String, ModelSourceError> {
  let name = url
    .path_segments()
    .and_then(|mut segments| segments.next_back())
    .filter(|name| !name.is_empty())
    .ok_or_else(|| ModelSourceError::InvalidPath(url.to_string()))?;
  let name = urlencoding::decode(name)
    .map_err(|_| ModelSourceError::InvalidPath(url.to_string()))?
    .into_owned();

  if name.contains("..") || name.contains('/') || name.contains('\\') {
    return Err(ModelSourceError::InvalidPath(name));
  }
  Ok(name)
}

fn download_client() -> Result<Client, ModelSourceError> {
  Ok(
    Client::builder()
      .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
      .build()?,
  )
}

fn ensure_downloaded<F>(url: &Url, model_dir: &Path, client: F) -> Result<PathBuf, ModelSourceError>
where
  F: FnOnce() -> Result<Client, ModelSourceError>,
{
  let name = file_name_of(url)?;
  let target = model_dir.join(&name);

  if let Ok(metadata) = fs::metadata(&target) {
    if metadata.is_file() && MODEL_SIZE_RANGE.contains(&metadata.len()) {
      info!("模型 {} 已存在: {}", name, target.display());
      return Ok(target);
    }
    warn!(
      "模型文件 {} 无效 ({} 字节)，重新下载",
      target.display(),
      metadata.len()
    );
  }

  if !model_dir.exists() {
    fs::create_dir_all(model_dir)?;
    info!("创建模型目录: {}", model_dir.display());
  }

  info!("下载模型 {} 自 {}", name, url);
  let mut response = client()?.get(url.clone()).send()?;

  if !response.status().is_success() {
    return Err(ModelSourceError::HttpStatus(response.status().as_u16()));
  }
  if let Some(length) = response.content_length() {
    debug!("模型文件大小: {:.2} MB", length as f64 / (1024.0 * 1024.0));
    if length > MAX_MODEL_SIZE {
      return Err(ModelSourceError::BadSize(length));
    }
  }

  // 先写入临时文件，校验后再重命名
  let temp = model_dir.join(format!("{}.{}.part", name, std::process::id()));
  let written = write_part(&mut response, &temp).inspect_err(|_| {
    let _ = fs::remove_file(&temp);
  })?;

  if !MODEL_SIZE_RANGE.contains(&written) {
    let _ = fs::remove_file(&temp);
    return Err(ModelSourceError::BadSize(written));
  }

  fs::rename(&temp, &target).inspect_err(|_| {
    let _ = fs::remove_file(&temp);
  })?;

  info!("模型 {} 已保存至 {} ({} 字节)", name, target.display(), written);
  Ok(target)
}

fn write_part(response: &mut Response, temp: &Path) -> Result<u64, ModelSourceError> {
  let mut file = fs::File::create(temp)?;
  let written = response.copy_to(&mut file)?;
  file.flush()?;
  Ok(written)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Read;
  use std::net::TcpListener;
  use std::thread;

  #[test]
  fn bare_paths_pick_kind_from_extension() {
    let source = ModelSource::parse("models/yolov8n.onnx").unwrap();
    assert_eq!(source.kind(), ModelKind::Onnx);
    assert!(!source.is_remote());

    let source = ModelSource::parse("/opt/npu/yolo.RKNN").unwrap();
    assert_eq!(source.kind(), ModelKind::Rknn);
  }

  #[test]
  fn explicit_schemes() {
    let source = ModelSource::parse("onnx:///opt/models/a%20b.bin").unwrap();
    assert_eq!(source.kind(), ModelKind::Onnx);
    assert_eq!(source.to_string(), "/opt/models/a b.bin");

    let source = ModelSource::parse("rknn:///opt/models/yolo.rknn").unwrap();
    assert_eq!(source.kind(), ModelKind::Rknn);

    let source = ModelSource::parse(DEFAULT_MODEL_URL).unwrap();
    assert_eq!(source.kind(), ModelKind::Onnx);
    assert!(source.is_remote());
  }

  #[test]
  fn rejects_unknown_schemes_and_formats() {
    assert!(matches!(
      ModelSource::parse("ftp://example.com/yolov8n.onnx"),
      Err(ModelSourceError::UnsupportedScheme(_))
    ));
    assert!(matches!(
      ModelSource::parse("weights/yolov8n.pt"),
      Err(ModelSourceError::UnknownFormat(_))
    ));
    assert!(matches!(
      ModelSource::parse("https://example.com/"),
      Err(ModelSourceError::InvalidPath(_))
    ));
  }

  #[test]
  fn missing_local_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let source = ModelSource::from_path(dir.path().join("yolov8n.onnx")).unwrap();
    assert!(matches!(
      source.fetch(dir.path()),
      Err(ModelSourceError::NotFound(_))
    ));
  }

  /// 本地 HTTP 服务，对每个连接返回同一个固定响应
  fn serve(status: &'static str, body: Vec<u8>, connections: usize) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
      for _ in 0..connections {
        let Ok((mut stream, _)) = listener.accept() else {
          return;
        };
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
          match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => request.extend_from_slice(&buf[..n]),
          }
        }
        let head = format!(
          "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
          status,
          body.len()
        );
        let _ = stream.write_all(head.as_bytes());
        let _ = stream.write_all(&body);
      }
    });
    Url::parse(&format!("http://{}/v1/yolov8n.onnx", addr)).unwrap()
  }

  fn local_client() -> Result<Client, ModelSourceError> {
    Ok(Client::builder().no_proxy().build()?)
  }

  fn leftovers(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect()
  }

  #[test]
  fn http_error_status_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let url = serve("404 Not Found", b"missing".to_vec(), 1);
    let source = ModelSource::from_url(&url).unwrap();

    assert!(matches!(
      source.fetch_with(dir.path(), local_client),
      Err(ModelSourceError::HttpStatus(404))
    ));
    assert!(leftovers(dir.path()).is_empty());
  }

  #[test]
  fn undersized_download_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let url = serve("200 OK", b"<html>oops</html>".to_vec(), 1);
    let source = ModelSource::from_url(&url).unwrap();

    assert!(matches!(
      source.fetch_with(dir.path(), local_client),
      Err(ModelSourceError::BadSize(17))
    ));
    assert!(leftovers(dir.path()).is_empty());
  }

  #[test]
  fn download_is_saved_then_reused() {
    let dir = tempfile::tempdir().unwrap();
    let body = vec![42u8; 4096];
    let url = serve("200 OK", body.clone(), 1);
    let source = ModelSource::from_url(&url).unwrap();

    let local = source.fetch_with(dir.path(), local_client).unwrap();
    assert_eq!(local.path, dir.path().join("yolov8n.onnx"));
    assert_eq!(fs::read(&local.path).unwrap(), body);
    assert_eq!(leftovers(dir.path()), vec!["yolov8n.onnx".to_string()]);

    // 服务只响应一次，再次获取必须命中缓存
    let again = source
      .fetch_with(dir.path(), || panic!("cached model must not be downloaded"))
      .unwrap();
    assert_eq!(again.path, local.path);
  }

  #[test]
  fn truncated_cache_is_downloaded_again() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("yolov8n.onnx"), b"trunc!").unwrap();
    let body = vec![9u8; 2048];
    let url = serve("200 OK", body.clone(), 1);
    let source = ModelSource::from_url(&url).unwrap();

    let local = source.fetch_with(dir.path(), local_client).unwrap();
    assert_eq!(fs::read(&local.path).unwrap(), body);
  }

  #[test]
  fn truncated_cache_is_not_trusted_offline() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("yolov8n.onnx"), b"trunc!").unwrap();

    let source = ModelSource::parse("https://models.invalid/v1/yolov8n.onnx").unwrap();
    assert!(source.fetch(dir.path()).is_err());
  }

  #[test]
  fn cached_remote_model_is_reused_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let cached = dir.path().join("yolov8n.onnx");
    fs::write(&cached, vec![7u8; 4096]).unwrap();

    // 不可解析的主机：若发起网络请求必然失败
    let source = ModelSource::parse("https://models.invalid/v1/yolov8n.onnx").unwrap();
    let local = source.fetch(dir.path()).unwrap();
    assert_eq!(local.path, cached);
    assert_eq!(local.kind, ModelKind::Onnx);
  }
}
