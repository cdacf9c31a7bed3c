//! WOPI 请求分类：根据路径、方法与覆盖头解析出唯一的操作类型。

use axum::http::{HeaderMap, Method};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::atomic::is_staging_name;
use crate::config::{
    HEADER_LOCK, HEADER_OLD_LOCK, HEADER_OVERRIDE, HEADER_RELATIVE_TARGET,
    HEADER_SUGGESTED_TARGET,
};

const WOPI_SEGMENT: &str = "/wopi/";
const FILES_PREFIX: &str = "files/";
const FOLDERS_PREFIX: &str = "folders/";
const CONTENTS_SUFFIX: &str = "/contents";
const CHILDREN_SUFFIX: &str = "/children";

/// 路径段编码时需要转义的字符集。
const ID_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Override values this host recognizes but does not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedKind {
    Cobalt,
    DeleteFile,
    ReadSecureStore,
    GetRestrictedLink,
    RevokeRestrictedLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CheckFileInfo,
    GetFile,
    PutFile,
    PutRelativeFile,
    Lock,
    Unlock,
    RefreshLock,
    UnlockAndRelock,
    CheckFolderInfo,
    EnumerateChildren,
    Unsupported(UnsupportedKind),
    None,
}

impl Operation {
    /// 是否需要写权限。
    pub fn requires_write(self) -> bool {
        matches!(
            self,
            Operation::PutFile
                | Operation::PutRelativeFile
                | Operation::Lock
                | Operation::Unlock
                | Operation::RefreshLock
                | Operation::UnlockAndRelock
        )
    }

    /// 本宿主实际执行的操作。
    pub fn is_executable(self) -> bool {
        matches!(
            self,
            Operation::CheckFileInfo
                | Operation::GetFile
                | Operation::PutFile
                | Operation::PutRelativeFile
                | Operation::Lock
                | Operation::Unlock
                | Operation::RefreshLock
                | Operation::UnlockAndRelock
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::CheckFileInfo => "CheckFileInfo",
            Operation::GetFile => "GetFile",
            Operation::PutFile => "PutFile",
            Operation::PutRelativeFile => "PutRelativeFile",
            Operation::Lock => "Lock",
            Operation::Unlock => "Unlock",
            Operation::RefreshLock => "RefreshLock",
            Operation::UnlockAndRelock => "UnlockAndRelock",
            Operation::CheckFolderInfo => "CheckFolderInfo",
            Operation::EnumerateChildren => "EnumerateChildren",
            Operation::Unsupported(UnsupportedKind::Cobalt) => "ExecuteCobaltRequest",
            Operation::Unsupported(UnsupportedKind::DeleteFile) => "DeleteFile",
            Operation::Unsupported(UnsupportedKind::ReadSecureStore) => "ReadSecureStore",
            Operation::Unsupported(UnsupportedKind::GetRestrictedLink) => "GetRestrictedLink",
            Operation::Unsupported(UnsupportedKind::RevokeRestrictedLink) => {
                "RevokeRestrictedLink"
            }
            Operation::None => "None",
        }
    }
}

/// PutRelativeFile 的目标名称提示。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetHints {
    /// `X-WOPI-RelativeTarget`：精确目标名，优先生效。
    pub relative: Option<String>,
    /// `X-WOPI-SuggestedTarget`：以 `.` 开头时视为扩展名。
    pub suggested: Option<String>,
}

/// 分类后的 WOPI 请求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WopiRequest {
    pub operation: Operation,
    pub id: String,
    pub access_token: Option<String>,
    pub lock: Option<String>,
    pub old_lock: Option<String>,
    pub targets: TargetHints,
}

impl WopiRequest {
    fn unmatched(access_token: Option<String>) -> Self {
        Self {
            operation: Operation::None,
            id: String::new(),
            access_token,
            lock: None,
            old_lock: None,
            targets: TargetHints::default(),
        }
    }
}

/// Classifies an inbound request. Every input maps to exactly one operation;
/// unmatched shapes yield [`Operation::None`].
pub fn classify(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    access_token: Option<String>,
) -> WopiRequest {
    let Some((_, wopi_path)) = path.split_once(WOPI_SEGMENT) else {
        return WopiRequest::unmatched(access_token);
    };

    let (operation, raw_id) = if let Some(raw) = wopi_path.strip_prefix(FILES_PREFIX) {
        if let Some(raw_id) = raw.strip_suffix(CONTENTS_SUFFIX) {
            let operation = match *method {
                Method::GET => Operation::GetFile,
                Method::POST => Operation::PutFile,
                _ => Operation::None,
            };
            (operation, raw_id)
        } else {
            let operation = match *method {
                Method::GET => Operation::CheckFileInfo,
                Method::POST => classify_override(headers),
                _ => Operation::None,
            };
            (operation, raw)
        }
    } else if let Some(raw) = wopi_path.strip_prefix(FOLDERS_PREFIX) {
        match raw.strip_suffix(CHILDREN_SUFFIX) {
            Some(raw_id) => (Operation::EnumerateChildren, raw_id),
            None => (Operation::CheckFolderInfo, raw),
        }
    } else {
        (Operation::None, "")
    };

    if operation == Operation::None {
        return WopiRequest::unmatched(access_token);
    }
    let Some(id) = decode_id(raw_id) else {
        return WopiRequest::unmatched(access_token);
    };

    WopiRequest {
        operation,
        id,
        access_token,
        lock: header_value(headers, HEADER_LOCK),
        old_lock: header_value(headers, HEADER_OLD_LOCK),
        targets: TargetHints {
            relative: header_value(headers, HEADER_RELATIVE_TARGET),
            suggested: header_value(headers, HEADER_SUGGESTED_TARGET),
        },
    }
}

fn classify_override(headers: &HeaderMap) -> Operation {
    let Some(value) = headers
        .get(HEADER_OVERRIDE)
        .and_then(|value| value.to_str().ok())
    else {
        return Operation::None;
    };

    match value {
        "LOCK" if headers.contains_key(HEADER_OLD_LOCK) => Operation::UnlockAndRelock,
        "LOCK" => Operation::Lock,
        "UNLOCK" => Operation::Unlock,
        "REFRESH_LOCK" => Operation::RefreshLock,
        "PUT_RELATIVE" => Operation::PutRelativeFile,
        "COBALT" => Operation::Unsupported(UnsupportedKind::Cobalt),
        "DELETE" => Operation::Unsupported(UnsupportedKind::DeleteFile),
        "READ_SECURE_STORE" => Operation::Unsupported(UnsupportedKind::ReadSecureStore),
        "GET_RESTRICTED_LINK" => Operation::Unsupported(UnsupportedKind::GetRestrictedLink),
        "REVOKE_RESTRICTED_LINK" => {
            Operation::Unsupported(UnsupportedKind::RevokeRestrictedLink)
        }
        _ => Operation::None,
    }
}

/// 解码单个路径段形式的标识符；空值、包含分隔符或指向写入临时文件时返回 None。
fn decode_id(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    let decoded = percent_decode_str(raw).decode_utf8().ok()?;
    if decoded.is_empty() || decoded.contains(['/', '\\']) || is_staging_name(&decoded) {
        return None;
    }
    Some(decoded.into_owned())
}

/// 将文件标识编码为 URL 路径段。
pub fn encode_id(id: &str) -> String {
    utf8_percent_encode(id, ID_ENCODE_SET).to_string()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
