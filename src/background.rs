//! 残留临时文件清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::atomic::cleanup_stale_temp_files;
use crate::config::TEMP_CLEAN_INTERVAL_SECS;
use crate::storage::Storage;

/// 启动后台任务，定期清理上传目录中的过期临时文件。
pub fn spawn_background_tasks(storage: Arc<Storage>, temp_ttl: Duration) {
    if temp_ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(TEMP_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_stale_temp_files(storage.root_path(), temp_ttl).await {
                warn!(error = %err, "upload temp cleanup failed");
            }
        }
    });
}
