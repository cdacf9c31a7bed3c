use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, ErrorKind};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

/// 存储中单个文件的快照。
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub read_only: bool,
    pub version: String,
}

impl FileRecord {
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        Self {
            path,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            read_only: metadata.permissions().readonly(),
            version: item_version(metadata),
        }
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath);
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 读取已存在文件的元数据，目录视为不存在。
    pub async fn stat_file(&self, id: &str) -> Result<FileRecord, StorageError> {
        let path = self.resolve_path_checked(id, false).await?;
        let metadata = fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound);
        }
        Ok(FileRecord::from_metadata(path, &metadata))
    }

    /// 读取文件元数据，文件不存在时返回 None（可作为新建目标）。
    pub async fn stat_target(
        &self,
        id: &str,
    ) -> Result<(PathBuf, Option<FileRecord>), StorageError> {
        let path = self.resolve_path_checked(id, true).await?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {
                let record = FileRecord::from_metadata(path.clone(), &metadata);
                Ok((path, Some(record)))
            }
            Ok(_) => Err(StorageError::NotFound),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok((path, None)),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 先打开再读取元数据：记录描述的正是该句柄上的内容，不受并发替换影响。
    pub async fn open_file(&self, id: &str) -> Result<(File, FileRecord), StorageError> {
        let path = self.resolve_path_checked(id, false).await?;
        let file = File::open(&path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound);
        }
        Ok((file, FileRecord::from_metadata(path, &metadata)))
    }
}

/// Version marker derived from the last write time, RFC 3339 with nanoseconds.
pub fn item_version(metadata: &Metadata) -> String {
    match metadata.modified() {
        Ok(modified) => {
            let datetime: DateTime<Utc> = modified.into();
            datetime.to_rfc3339_opts(SecondsFormat::Nanos, true)
        }
        Err(_) => format!("size-{}", metadata.len()),
    }
}

/// 从句柄当前位置读到末尾，计算 SHA-256 并以标准 base64 编码返回。
pub async fn content_sha256(file: &mut File) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(STANDARD.encode(hasher.finalize()))
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    NotFound,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
