//! 表单上传处理器：大小上限、扩展名校验、冲突改名与原子落盘。

use axum::body::Bytes;
use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Extension, Multipart};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

use crate::atomic::AtomicFile;
use crate::config::Settings;
use crate::error::ApiError;
use crate::storage::{Storage, StorageError, sanitize_file_name};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("no file was uploaded")]
    NoFile,
    #[error("file type not allowed: {0}")]
    RejectedExtension(String),
    #[error("invalid multipart body: {0}")]
    Multipart(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl UploadError {
    fn status(&self) -> StatusCode {
        match self {
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::NoFile
            | UploadError::RejectedExtension(_)
            | UploadError::Multipart(_)
            | UploadError::Storage(StorageError::InvalidName) => StatusCode::BAD_REQUEST,
            UploadError::Storage(StorageError::PathTraversal(_)) => StatusCode::FORBIDDEN,
            UploadError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 返回给客户端的说明，服务端错误不暴露细节。
    fn public_message(&self) -> String {
        if self.status().is_server_error() {
            "could not save file".to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::TooLarge { limit } => ApiError::PayloadTooLarge(limit),
            UploadError::Storage(err) => err.into(),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Stored,
    Rejected,
    Failed,
}

/// 单个文件分段的处理结果。
#[derive(Debug, Serialize)]
pub struct FileOutcome {
    pub original_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_name: Option<String>,
    pub size_bytes: u64,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    http_status: StatusCode,
}

#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub success: bool,
    pub message: String,
    pub files: Vec<FileOutcome>,
}

/// 处理 `POST /` 的多文件上传。
///
/// 至少一个文件保存成功即返回 200；否则返回第一个失败项的状态码。
/// 超出大小上限或请求体损坏时整体中止，本次请求已保存的文件会被删除。
pub async fn upload_files(
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(settings): Extension<Arc<Settings>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<UploadReport>), ApiError> {
    let limit = settings.max_file_size;
    if let Some(declared) = declared_length(&headers)
        && declared > limit
    {
        warn!(declared, limit, "upload rejected by declared length");
        return Err(UploadError::TooLarge { limit }.into());
    }

    let mut session = UploadSession::new(&storage, &settings);
    if let Err(err) = session.receive(&mut multipart).await {
        warn!(error = %err, received = session.received, "upload aborted");
        session.rollback().await;
        return Err(err.into());
    }
    session.finish().map_err(ApiError::from)
}

struct UploadSession<'a> {
    storage: &'a Storage,
    settings: &'a Settings,
    received: u64,
    files: Vec<FileOutcome>,
    stored: Vec<PathBuf>,
}

impl<'a> UploadSession<'a> {
    fn new(storage: &'a Storage, settings: &'a Settings) -> Self {
        Self {
            storage,
            settings,
            received: 0,
            files: Vec::new(),
            stored: Vec::new(),
        }
    }

    /// 逐个处理分段；返回错误表示整个请求需要中止。
    async fn receive(&mut self, multipart: &mut Multipart) -> Result<(), UploadError> {
        while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
            let original = match field.file_name() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => {
                    self.drain(&mut field).await?;
                    continue;
                }
            };
            let start = self.received;

            let name = match sanitize_file_name(&original) {
                Ok(name) => name,
                Err(err) => {
                    self.drain(&mut field).await?;
                    warn!(name = original, "invalid file name");
                    let size = self.received - start;
                    self.record_failure(original, size, FileStatus::Rejected, err.into());
                    continue;
                }
            };
            if !self.settings.extensions.is_allowed(&name) {
                self.drain(&mut field).await?;
                warn!(name = original, "file type not allowed");
                let err = UploadError::RejectedExtension(original.clone());
                self.record_failure(original, self.received - start, FileStatus::Rejected, err);
                continue;
            }

            match self.write_field(&mut field, &name).await {
                Ok((stored_name, path)) => {
                    let size = self.received - start;
                    info!(name = original, stored = stored_name, bytes = size, "file uploaded");
                    self.stored.push(path);
                    self.files.push(FileOutcome {
                        original_name: original,
                        stored_name: Some(stored_name),
                        size_bytes: size,
                        status: FileStatus::Stored,
                        error: None,
                        http_status: StatusCode::OK,
                    });
                }
                Err(err @ (UploadError::TooLarge { .. } | UploadError::Multipart(_))) => {
                    return Err(err);
                }
                Err(err) => {
                    self.drain(&mut field).await?;
                    error!(name = original, error = %err, "failed to store upload");
                    self.record_failure(original, self.received - start, FileStatus::Failed, err);
                }
            }
        }
        Ok(())
    }

    /// 将分段写入临时文件，写完后以不冲突的名称发布。
    ///
    /// 任何失败都会通过 drop 删除临时文件，上传目录中不会留下残缺文件。
    async fn write_field(
        &mut self,
        field: &mut Field<'_>,
        name: &str,
    ) -> Result<(String, PathBuf), UploadError> {
        let storage = self.storage;
        let mut atomic = AtomicFile::new(storage.root_path(), name)
            .await
            .map_err(StorageError::from)?;
        while let Some(chunk) = self.next_chunk(field).await? {
            atomic.write_all(&chunk).await.map_err(StorageError::from)?;
        }
        Ok(storage.place(atomic, name).await?)
    }

    /// 读取下一块数据并累计请求字节数，超过上限立即中止。
    async fn next_chunk(&mut self, field: &mut Field<'_>) -> Result<Option<Bytes>, UploadError> {
        let Some(chunk) = field.chunk().await.map_err(multipart_error)? else {
            return Ok(None);
        };
        self.received = self.received.saturating_add(chunk.len() as u64);
        if self.received > self.settings.max_file_size {
            return Err(UploadError::TooLarge {
                limit: self.settings.max_file_size,
            });
        }
        Ok(Some(chunk))
    }

    async fn drain(&mut self, field: &mut Field<'_>) -> Result<(), UploadError> {
        while self.next_chunk(field).await?.is_some() {}
        Ok(())
    }

    fn record_failure(
        &mut self,
        original_name: String,
        size_bytes: u64,
        status: FileStatus,
        err: UploadError,
    ) {
        self.files.push(FileOutcome {
            original_name,
            stored_name: None,
            size_bytes,
            status,
            error: Some(err.public_message()),
            http_status: err.status(),
        });
    }

    async fn rollback(&mut self) {
        for path in self.stored.drain(..) {
            match fs::remove_file(&path).await {
                Ok(()) => info!(path = ?path, "removed file from aborted upload"),
                Err(err) => warn!(path = ?path, error = %err, "failed to remove file from aborted upload"),
            }
        }
    }

    fn finish(self) -> Result<(StatusCode, JsonResponse<UploadReport>), UploadError> {
        if self.files.is_empty() {
            return Err(UploadError::NoFile);
        }

        let stored = self
            .files
            .iter()
            .filter(|file| file.status == FileStatus::Stored)
            .count();
        let failed = self.files.len() - stored;
        let status = if stored > 0 {
            StatusCode::OK
        } else {
            self.files
                .iter()
                .map(|file| file.http_status)
                .next()
                .unwrap_or(StatusCode::BAD_REQUEST)
        };
        let mut message = format!("Uploaded {stored} files");
        if failed > 0 {
            message.push_str(&format!(", {failed} errors"));
        }

        Ok((
            status,
            JsonResponse(UploadReport {
                success: stored > 0,
                message,
                files: self.files,
            }),
        ))
    }
}

fn multipart_error(err: MultipartError) -> UploadError {
    UploadError::Multipart(err.body_text())
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}
