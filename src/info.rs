//! CheckFileInfo 与 PutRelativeFile 的响应体。

use serde::Serialize;

use crate::config::HostConfig;
use crate::operation::encode_id;
use crate::storage::FileRecord;

/// Subset of the CheckFileInfo properties this host reports.
#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct CheckFileInfoResponse {
    pub base_file_name: String,
    pub owner_id: String,
    pub size: u64,
    pub user_id: String,
    pub version: String,

    pub read_only: bool,
    pub user_can_write: bool,
    pub user_can_not_write_relative: bool,
    pub supports_locks: bool,
    pub supports_get_lock: bool,
    pub supports_update: bool,
    pub supports_editing: bool,
    pub supports_folders: bool,
    pub supports_cobalt: bool,

    pub user_friendly_name: String,
    pub breadcrumb_brand_name: String,
    pub breadcrumb_brand_url: String,
    pub breadcrumb_folder_name: String,
    pub breadcrumb_folder_url: String,
    pub breadcrumb_doc_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_view_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_edit_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_url: Option<String>,

    #[serde(rename = "SHA256")]
    pub sha256: String,
}

impl CheckFileInfoResponse {
    pub fn new(record: &FileRecord, host: &HostConfig, base_url: &str, sha256: String) -> Self {
        let name = record.name();
        let folder_name = record
            .path
            .parent()
            .and_then(|parent| parent.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            base_file_name: name.clone(),
            owner_id: host.owner_id.clone(),
            size: record.size,
            user_id: host.user_id.clone(),
            version: record.version.clone(),
            read_only: record.read_only,
            user_can_write: !record.read_only,
            user_can_not_write_relative: false,
            supports_locks: true,
            supports_get_lock: false,
            supports_update: true,
            supports_editing: true,
            supports_folders: false,
            supports_cobalt: false,
            user_friendly_name: host.user_friendly_name.clone(),
            breadcrumb_brand_name: host.brand_name.clone(),
            breadcrumb_brand_url: base_url.to_string(),
            breadcrumb_folder_name: folder_name,
            breadcrumb_folder_url: base_url.to_string(),
            breadcrumb_doc_name: record.stem(),
            host_view_url: HostConfig::host_page_url(host.host_view_url.as_deref(), &name),
            host_edit_url: HostConfig::host_page_url(host.host_edit_url.as_deref(), &name),
            close_url: host.close_url.clone(),
            sha256,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct PutRelativeFileResponse {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_view_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_edit_url: Option<String>,
}

impl PutRelativeFileResponse {
    /// `Url` 指向新文件的 WOPI 端点，并携带请求方的访问令牌。
    pub fn new(record: &FileRecord, host: &HostConfig, base_url: &str, access_token: &str) -> Self {
        let name = record.name();
        let url = format!(
            "{base_url}/wopi/files/{}?access_token={}",
            encode_id(&name),
            encode_id(access_token)
        );
        Self {
            host_view_url: HostConfig::host_page_url(host.host_view_url.as_deref(), &name),
            host_edit_url: HostConfig::host_page_url(host.host_edit_url.as_deref(), &name),
            name,
            url,
        }
    }
}
