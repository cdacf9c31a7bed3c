//! 临时写入与原子替换的辅助方法。

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::storage::StorageError;

/// 新写入的修改时间至少比旧版本晚这么多，保证版本标记不重复。
const VERSION_STEP: Duration = Duration::from_micros(1);

/// 临时文件名前缀为 `.`，后缀为 `.tmp.<uuid>`。
const STAGING_MARKER: &str = ".tmp.";

/// 未提交的临时文件在析构时删除（请求被取消时同样生效）。
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 可用于原子替换的临时文件封装。
pub struct AtomicFile {
    target: PathBuf,
    staging: StagingGuard,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> Result<Self, StorageError> {
        let parent = target.parent().ok_or(StorageError::InvalidPath)?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}{STAGING_MARKER}{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            staging: StagingGuard {
                path: temp_path,
                armed: true,
            },
            file,
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(mut self) {
        let _ = fs::remove_file(&self.staging.path).await;
        self.staging.armed = false;
    }

    /// 同步并原子替换目标文件；`previous` 为被替换版本的修改时间。
    ///
    /// Returns the metadata of the committed content, read from the staged
    /// handle before the rename so it cannot describe a later write.
    pub async fn finalize(self, previous: Option<SystemTime>) -> Result<Metadata, StorageError> {
        let AtomicFile {
            target,
            mut staging,
            mut file,
        } = self;
        file.flush().await?;
        let stamp = next_write_time(SystemTime::now(), previous);
        let std_file = file.into_std().await;
        let metadata = tokio::task::spawn_blocking(move || {
            std_file.set_modified(stamp)?;
            std_file.sync_all()?;
            std_file.metadata()
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))??;

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        if let Err(err) = fs::rename(&staging.path, &target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&target).await.is_ok() {
                    fs::rename(&staging.path, &target).await?;
                } else {
                    return Err(StorageError::Io(err));
                }
            }
            #[cfg(not(windows))]
            {
                return Err(StorageError::Io(err));
            }
        }
        staging.armed = false;

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(metadata)
    }
}

/// 是否为写入过程中的临时文件名。
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(STAGING_MARKER)
}

fn next_write_time(now: SystemTime, previous: Option<SystemTime>) -> SystemTime {
    match previous {
        Some(previous) if now <= previous => previous + VERSION_STEP,
        _ => now,
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn next_write_time_never_repeats_previous() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(next_write_time(now, None), now);
        assert_eq!(next_write_time(now, Some(now)), now + VERSION_STEP);
        let future = now + Duration::from_secs(5);
        assert_eq!(next_write_time(now, Some(future)), future + VERSION_STEP);
        let past = now - Duration::from_secs(5);
        assert_eq!(next_write_time(now, Some(past)), now);
    }

    #[tokio::test]
    async fn finalize_replaces_target_and_removes_temp() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("doc.txt");
        std::fs::write(&target, b"old").expect("write old");
        let previous = std::fs::metadata(&target)
            .and_then(|metadata| metadata.modified())
            .expect("modified");

        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"new").await.expect("write");
        let committed = atomic.finalize(Some(previous)).await.expect("finalize");

        assert_eq!(std::fs::read(&target).expect("read"), b"new");
        let modified = std::fs::metadata(&target)
            .and_then(|metadata| metadata.modified())
            .expect("modified");
        assert!(modified > previous);
        assert_eq!(committed.modified().expect("modified"), modified);
        assert_eq!(committed.len(), 3);
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn cleanup_leaves_target_untouched() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("doc.txt");
        std::fs::write(&target, b"old").expect("write old");

        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"partial").await.expect("write");
        atomic.cleanup().await;

        assert_eq!(std::fs::read(&target).expect("read"), b"old");
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn dropped_staging_file_is_removed() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("doc.txt");
        std::fs::write(&target, b"old").expect("write old");

        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"partial").await.expect("write");
        drop(atomic);

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["doc.txt".to_string()]);
        assert_eq!(std::fs::read(&target).expect("read"), b"old");
    }

    #[test]
    fn staging_names_are_recognized() {
        assert!(is_staging_name(".doc.txt.tmp.0b7e3c1a"));
        assert!(!is_staging_name("doc.txt"));
        assert!(!is_staging_name(".hidden"));
    }
}
