//! 上传目录：文件名清洗、路径约束、冲突改名与列表/删除。

use chrono::{DateTime, Utc};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tracing::warn;

use crate::atomic::AtomicFile;

pub const MAX_COLLISION_ATTEMPTS: u32 = 1000;
/// 预留 `_1000` 后缀的空间，保证最终文件名不超过常见文件系统的 255 字节上限。
pub const MAX_NAME_BYTES: usize = 240;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name")]
    InvalidName,
    #[error("path escapes upload directory: {0}")]
    PathTraversal(String),
    #[error("no free file name for {0}")]
    CollisionExhausted(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// 创建并规范化上传根目录。
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 为上传预留一个不冲突的目标文件名。
    ///
    /// 使用独占创建占位文件，`name.ext` 已存在时依次尝试 `name_1.ext`、`name_2.ext`……
    /// 返回的 [`Reservation`] 未提交即被丢弃时会删除占位文件。
    pub async fn reserve(&self, requested: &str) -> Result<Reservation, StorageError> {
        let base = sanitize_file_name(requested)?;
        for attempt in 0..=MAX_COLLISION_ATTEMPTS {
            let name = candidate_name(&base, attempt);
            let path = self.root.join(&name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    let reservation = Reservation::new(path, name);
                    self.ensure_contained(reservation.path(), reservation.name())
                        .await?;
                    return Ok(reservation);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
        Err(StorageError::CollisionExhausted(base))
    }

    /// 将写好的临时文件以不冲突的名称发布到上传目录。
    ///
    /// 通过硬链接独占候选名，名字只会被完整的文件占用；文件系统不支持硬链接时
    /// 退回到 [`Storage::reserve`] 占位后再原子替换。
    pub async fn place(
        &self,
        mut file: AtomicFile,
        requested: &str,
    ) -> Result<(String, PathBuf), StorageError> {
        let base = sanitize_file_name(requested)?;
        for attempt in 0..=MAX_COLLISION_ATTEMPTS {
            let name = candidate_name(&base, attempt);
            let path = self.root.join(&name);
            match file.link_to(&path).await {
                Ok(()) => return Ok((name, path)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) if links_unsupported(&err) => {
                    warn!(error = %err, "hard links unavailable, using placeholder reservation");
                    let reservation = self.reserve(&base).await?;
                    file.finalize(reservation.path()).await?;
                    return Ok(reservation.commit());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StorageError::CollisionExhausted(base))
    }

    /// 解析一个已存在的文件，供下载与删除使用。
    ///
    /// 请求名必须本身就是普通文件名；带目录成分或隐藏前缀的请求一律视为越界。
    /// 返回根目录下的条目路径，其真实路径已确认仍在根目录内。
    pub async fn resolve_existing(&self, requested: &str) -> Result<PathBuf, StorageError> {
        if requested.is_empty() {
            return Err(StorageError::InvalidName);
        }
        let name = match sanitize_file_name(requested) {
            Ok(name) if name == requested => name,
            _ => {
                warn!(requested, "path traversal blocked");
                return Err(StorageError::PathTraversal(requested.to_string()));
            }
        };

        let entry = self.root.join(&name);
        match fs::symlink_metadata(&entry).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name));
            }
            Err(err) => return Err(err.into()),
        }
        let canonical = match self.ensure_contained(&entry, &name).await {
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name));
            }
            other => other?,
        };
        if !fs::metadata(&canonical).await?.is_file() {
            return Err(StorageError::NotFound(name));
        }
        Ok(entry)
    }

    /// 校验真实路径的父目录正好是上传根目录。
    async fn ensure_contained(&self, path: &Path, name: &str) -> Result<PathBuf, StorageError> {
        let canonical = fs::canonicalize(path).await?;
        if canonical.parent() != Some(self.root.as_path()) {
            warn!(
                name,
                resolved = %canonical.display(),
                "path traversal blocked"
            );
            return Err(StorageError::PathTraversal(name.to_string()));
        }
        Ok(canonical)
    }

    /// 非递归列出上传目录中的普通文件，按名称（忽略大小写）排序。
    pub async fn list_files(&self) -> Result<Vec<StoredFile>, StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry.file_type().await?.is_symlink()
                && self.ensure_contained(&path, &name).await.is_err()
            {
                continue;
            }
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(format_timestamp);

            files.push(StoredFile {
                name,
                size: metadata.len(),
                modified,
            });
        }

        files.sort_by_key(|file| file.name.to_lowercase());
        Ok(files)
    }

    /// 删除文件；不存在时每次都返回 `NotFound`。
    pub async fn delete_file(&self, requested: &str) -> Result<(), StorageError> {
        let entry = self.resolve_existing(requested).await?;
        match fs::remove_file(&entry).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(requested.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// 将请求名缩减为安全的单层文件名。
///
/// 只保留最后一个 `/` 或 `\` 之后的部分，去掉控制字符、前导点与首尾空白。
/// 结果再次清洗不会改变，扩展名校验与落盘使用的是同一个名字。
pub fn sanitize_file_name(requested: &str) -> Result<String, StorageError> {
    let base = requested.rsplit(['/', '\\']).next().unwrap_or(requested);
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned
        .trim_start_matches(|c: char| c == '.' || c.is_whitespace())
        .trim_end();
    if cleaned.is_empty() || cleaned.len() > MAX_NAME_BYTES {
        return Err(StorageError::InvalidName);
    }
    Ok(cleaned.to_string())
}

fn links_unsupported(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Unsupported | ErrorKind::PermissionDenied
    )
}

/// 第 `attempt` 次尝试的候选名：`archive.tar.gz` -> `archive.tar_1.gz`。
fn candidate_name(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        return base.to_string();
    }
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{attempt}.{ext}"),
        _ => format!("{base}_{attempt}"),
    }
}

fn format_timestamp(duration: Duration) -> String {
    let timestamp = UNIX_EPOCH + duration;
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// 已独占创建的目标文件名占位。
#[derive(Debug)]
pub struct Reservation {
    path: PathBuf,
    name: String,
    committed: bool,
}

impl Reservation {
    fn new(path: PathBuf, name: String) -> Self {
        Self {
            path,
            name,
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 数据已写入占位路径，保留文件并返回最终文件名。
    pub fn commit(mut self) -> (String, PathBuf) {
        self.committed = true;
        (
            std::mem::take(&mut self.name),
            std::mem::take(&mut self.path),
        )
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = ?self.path, error = %err, "failed to release reserved file name");
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub modified: Option<String>,
}
