//! 临时写入与原子替换的辅助方法。

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

const TEMP_MARKER: &str = ".tmp.";
/// 临时文件名中保留的目标名前缀长度上限。
///
/// `.` + 前缀 + `.tmp.` + UUID 最多 106 字节，远低于 255 字节的文件名上限。
const TEMP_NAME_PREFIX_BYTES: usize = 64;

/// 可用于原子发布的临时文件封装。
///
/// 未发布就被丢弃时，临时文件会被删除。
pub struct AtomicFile {
    temp_path: PathBuf,
    file: Option<File>,
}

impl AtomicFile {
    /// 在 `dir` 中创建隐藏的临时文件，`name` 只用于生成便于辨认的临时名。
    pub async fn new(dir: &Path, name: &str) -> io::Result<Self> {
        let temp_path = dir.join(temp_file_name(name));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            temp_path,
            file: Some(file),
        })
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data).await,
            None => Err(io::Error::other("temp file already closed")),
        }
    }

    /// 刷新并同步数据，之后不能再写入。
    async fn sync(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// 以硬链接在 `target` 发布内容，不会覆盖已有文件。
    ///
    /// `target` 已存在时返回 `AlreadyExists`，临时文件保持不变，可换名重试。
    pub async fn link_to(&mut self, target: &Path) -> io::Result<()> {
        self.sync().await?;
        fs::hard_link(&self.temp_path, target).await?;

        let temp_path = std::mem::take(&mut self.temp_path);
        if let Err(err) = fs::remove_file(&temp_path).await {
            warn!(path = ?temp_path, error = %err, "failed to remove temp file");
        }
        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    /// 同步并原子替换 `target`。
    pub async fn finalize(mut self, target: &Path) -> io::Result<()> {
        self.sync().await?;

        if let Err(err) = fs::rename(&self.temp_path, target).await {
            #[cfg(windows)]
            {
                fs::remove_file(target).await.map_err(|_| err)?;
                fs::rename(&self.temp_path, target).await?;
            }
            #[cfg(not(windows))]
            {
                return Err(err);
            }
        }
        self.temp_path = PathBuf::new();

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.temp_path.as_os_str().is_empty() {
            return;
        }
        drop(self.file.take());
        if let Err(err) = std::fs::remove_file(&self.temp_path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = ?self.temp_path, error = %err, "failed to remove temp file");
        }
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

fn temp_file_name(name: &str) -> String {
    let mut end = name.len().min(TEMP_NAME_PREFIX_BYTES);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!(".{}{TEMP_MARKER}{}", &name[..end], Uuid::new_v4())
}

/// 判断文件名是否为 [`AtomicFile`] 产生的临时文件。
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// 清理目录中超过 `ttl` 的残留临时文件，返回删除数量。
pub async fn cleanup_stale_temp_files(dir: &Path, ttl: Duration) -> io::Result<usize> {
    if ttl.is_zero() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !is_temp_file_name(&name.to_string_lossy()) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let age = match metadata.modified().map(|ts| now.duration_since(ts)) {
            Ok(Ok(age)) => age,
            _ => continue,
        };
        if age < ttl {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                info!(path = ?path, "removed stale upload temp file");
            }
            Err(err) => warn!(path = ?path, error = %err, "failed to remove stale upload temp file"),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn finalize_replaces_target() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("report.pdf");
        std::fs::write(&target, b"").expect("placeholder");

        let mut atomic = AtomicFile::new(temp.path(), "report.pdf")
            .await
            .expect("create");
        atomic.write_all(b"hello").await.expect("write");
        atomic.finalize(&target).await.expect("finalize");

        assert_eq!(std::fs::read(&target).expect("read"), b"hello");
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn link_never_overwrites_existing_target() {
        let temp = tempdir().expect("tempdir");
        let taken = temp.path().join("a.txt");
        std::fs::write(&taken, b"old").expect("seed");

        let mut atomic = AtomicFile::new(temp.path(), "a.txt").await.expect("create");
        atomic.write_all(b"new").await.expect("write");
        let err = atomic.link_to(&taken).await.expect_err("target exists");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&taken).expect("read"), b"old");

        let free = temp.path().join("a_1.txt");
        atomic.link_to(&free).await.expect("link");
        drop(atomic);
        assert_eq!(std::fs::read(&free).expect("read"), b"new");
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 2);
    }

    #[tokio::test]
    async fn dropping_unfinished_file_removes_temp() {
        let temp = tempdir().expect("tempdir");

        let mut atomic = AtomicFile::new(temp.path(), "report.pdf")
            .await
            .expect("create");
        atomic.write_all(b"partial").await.expect("write");
        drop(atomic);

        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn long_target_names_get_bounded_temp_names() {
        let temp = tempdir().expect("tempdir");
        let name = format!("{}.txt", "é".repeat(118));
        assert_eq!(name.len(), 240);

        let atomic = AtomicFile::new(temp.path(), &name).await.expect("create");
        let temp_name = atomic
            .temp_path
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .to_string();
        assert!(temp_name.len() <= 1 + TEMP_NAME_PREFIX_BYTES + TEMP_MARKER.len() + 36);
        assert!(temp_name.starts_with(&format!(".{}", "é".repeat(32))));
        assert!(is_temp_file_name(&temp_name));
    }

    #[test]
    fn temp_names_are_recognized() {
        assert!(is_temp_file_name(".photo.png.tmp.0b7f"));
        assert!(!is_temp_file_name("photo.png"));
        assert!(!is_temp_file_name(".gitignore"));
    }

    #[tokio::test]
    async fn cleanup_only_touches_temp_files() {
        let temp = tempdir().expect("tempdir");
        let stale = temp.path().join(".a.txt.tmp.1");
        let old = SystemTime::now() - Duration::from_secs(3600);
        for path in [stale.clone(), temp.path().join("a.txt")] {
            std::fs::write(&path, b"x").expect("write");
            std::fs::File::options()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_modified(old))
                .expect("backdate");
        }
        std::fs::write(temp.path().join(".b.txt.tmp.2"), b"fresh").expect("write");

        let removed = cleanup_stale_temp_files(temp.path(), Duration::from_secs(60))
            .await
            .expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(temp.path().join("a.txt").exists());
        assert!(temp.path().join(".b.txt.tmp.2").exists());

        let disabled = cleanup_stale_temp_files(temp.path(), Duration::ZERO)
            .await
            .expect("cleanup");
        assert_eq!(disabled, 0);
    }
}
