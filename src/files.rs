//! 文件下载与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use httpdate::fmt_http_date;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::error::ApiError;
use crate::storage::Storage;

/// 以附件形式流式下载文件。
pub async fn download_file(
    Path(filename): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_existing(&filename).await?;
    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let file_size = metadata.len();
    let mime = mime_guess::from_path(&filename).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&file_size.to_string())
            .map_err(|_| ApiError::Internal("failed to build response header".into()))?,
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&filename))
            .map_err(|_| ApiError::Internal("failed to build response header".into()))?,
    );
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build response header".into()))?,
        );
    }

    info!(name = filename, size = file_size, "download file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 删除文件后重定向回首页。
pub async fn delete_file(
    Path(filename): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Redirect, ApiError> {
    storage.delete_file(&filename).await?;
    info!(name = filename, "file deleted");
    Ok(Redirect::to("/"))
}

/// 构造 `attachment` 头：ASCII 回退名加 RFC 5987 编码的原名。
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
