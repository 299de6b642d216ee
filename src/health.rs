//! 健康检查处理器。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;

use crate::config::Settings;

#[derive(Debug, Serialize)]
pub struct HealthInfo {
    status: &'static str,
    upload_dir: String,
    max_file_size: u64,
    allowed_extensions: Vec<String>,
}

/// 返回当前运行配置摘要。
pub async fn health(Extension(settings): Extension<Arc<Settings>>) -> JsonResponse<HealthInfo> {
    JsonResponse(HealthInfo {
        status: "healthy",
        upload_dir: settings.upload_dir.to_string_lossy().into_owned(),
        max_file_size: settings.max_file_size,
        allowed_extensions: settings.extensions.dotted(),
    })
}
