//! 文件读写网关：在租约决策之后执行字节级读写，并返回新的版本标记。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::atomic::{AtomicFile, is_staging_name};
use crate::error::WopiError;
use crate::lease::LeaseTable;
use crate::operation::TargetHints;
use crate::storage::{FileRecord, Storage, StorageError};

/// Applies lease decisions to the storage collaborator.
#[derive(Debug)]
pub struct FileGateway {
    storage: Arc<Storage>,
    leases: Arc<LeaseTable>,
}

impl FileGateway {
    pub fn new(storage: Arc<Storage>, leases: Arc<LeaseTable>) -> Self {
        Self { storage, leases }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// 查询已存在文件，缺失时返回 404。
    pub async fn stat(&self, id: &str) -> Result<FileRecord, WopiError> {
        Ok(self.storage.stat_file(id).await?)
    }

    /// 打开文件用于读取，同时返回当前版本。
    pub async fn get_file(&self, id: &str) -> Result<(File, FileRecord), WopiError> {
        Ok(self.storage.open_file(id).await?)
    }

    /// 覆盖已存在文件的内容。
    pub async fn put_file(
        &self,
        id: &str,
        lock: Option<&str>,
        body: AxumBody,
    ) -> Result<FileRecord, WopiError> {
        self.storage.stat_file(id).await?;
        let record = self.write_leased(id, lock, body).await?;
        info!(file_id = id, size = record.size, version = %record.version, "put file");
        Ok(record)
    }

    /// 以源文件为基准写入一个新的（或已存在的）目标文件。
    pub async fn put_relative_file(
        &self,
        source_id: &str,
        targets: &TargetHints,
        lock: Option<&str>,
        body: AxumBody,
    ) -> Result<FileRecord, WopiError> {
        let target_id = resolve_relative_target(source_id, targets)?;
        self.storage.stat_file(source_id).await?;
        let record = self.write_leased(&target_id, lock, body).await?;
        info!(
            file_id = source_id,
            target = target_id,
            size = record.size,
            "put relative file"
        );
        Ok(record)
    }

    /// The lease decision and the creation of the staging file happen under one
    /// lease-table guard, so no write starts after a later lease change.
    async fn write_leased(
        &self,
        id: &str,
        lock: Option<&str>,
        body: AxumBody,
    ) -> Result<FileRecord, WopiError> {
        let (mut staged, target, previous) = {
            let mut leases = self.leases.begin().await;
            let (target, existing) = self.storage.stat_target(id).await?;
            if existing.as_ref().is_some_and(|record| record.read_only) {
                return Err(WopiError::NotFound("file is read-only".into()));
            }
            let current_len = existing.as_ref().map_or(0, |record| record.size);
            if let Err(mismatch) = leases.authorize_write(id, lock, current_len) {
                debug!(file_id = id, current = ?mismatch.current, "write rejected by lease");
                return Err(mismatch.into());
            }
            let previous = existing.and_then(|record| record.modified);
            (AtomicFile::new(&target).await?, target, previous)
        };

        let write_result: Result<u64, StorageError> = async {
            let mut written = 0u64;
            let mut data_stream = BodyExt::into_data_stream(body);
            while let Some(chunk) = data_stream.next().await {
                let chunk = chunk.map_err(|err: AxumError| std::io::Error::other(err))?;
                if !chunk.is_empty() {
                    staged.file_mut().write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
            }
            Ok(written)
        }
        .await;
        let written = match write_result {
            Ok(written) => written,
            Err(err) => {
                staged.cleanup().await;
                return Err(err.into());
            }
        };
        let committed = staged.finalize(previous).await?;
        let record = FileRecord::from_metadata(target, &committed);
        debug!(file_id = id, bytes = written, version = %record.version, "write committed");
        Ok(record)
    }
}

/// 解析 PutRelativeFile 的目标名：精确目标优先，建议目标以 `.` 开头时作为源文件名的扩展。
pub fn resolve_relative_target(
    source_id: &str,
    targets: &TargetHints,
) -> Result<String, WopiError> {
    let name = match (targets.relative.as_deref(), targets.suggested.as_deref()) {
        (Some(exact), _) => exact.to_string(),
        (None, Some(suggested)) if suggested.starts_with('.') => {
            format!("{source_id}{suggested}")
        }
        (None, Some(suggested)) => suggested.to_string(),
        (None, None) => {
            return Err(WopiError::BadRequest(
                "relative or suggested target is required".into(),
            ));
        }
    };
    let name = name.trim();
    if name.is_empty()
        || name.contains(['/', '\\'])
        || name == "."
        || name == ".."
        || is_staging_name(name)
    {
        return Err(WopiError::BadRequest("invalid target name".into()));
    }
    Ok(name.to_string())
}
