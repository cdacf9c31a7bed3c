//! CLI 参数、WOPI 协议常量与宿主配置默认值。

use clap::Parser;
use shadow_rs::formatcp;
use std::time::Duration;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

/// WOPI 协议头，按 `HeaderName::from_static` 要求使用小写。
pub const HEADER_OVERRIDE: &str = "x-wopi-override";
pub const HEADER_LOCK: &str = "x-wopi-lock";
pub const HEADER_OLD_LOCK: &str = "x-wopi-oldlock";
pub const HEADER_LOCK_FAILURE_REASON: &str = "x-wopi-lockfailurereason";
pub const HEADER_ITEM_VERSION: &str = "x-wopi-itemversion";
pub const HEADER_RELATIVE_TARGET: &str = "x-wopi-relativetarget";
pub const HEADER_SUGGESTED_TARGET: &str = "x-wopi-suggestedtarget";
pub const HEADER_HANDLER_DIAG: &str = "x-wopi-handlerdiag";

pub const DEFAULT_LEASE_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_LEASE_PRUNE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_BRAND_NAME: &str = "AxoWopi";
pub const DEFAULT_OWNER_ID: &str = "documentOwnerId";
pub const DEFAULT_USER_ID: &str = "wopi-user";
pub const DEFAULT_USER_FRIENDLY_NAME: &str = "A WOPI User";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-wopi", version = VERSION_INFO, about = "AxoWopi host server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_WOPI_STORAGE_DIR",
        default_value = ".axo/wopi",
        help = "Storage directory for WOPI files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "AXO_WOPI_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_WOPI_HTTP_PORT",
        default_value_t = 5105,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "AXO_WOPI_HTTPS_PORT",
        default_value_t = 5106,
        help = "HTTPS port"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "AXO_WOPI_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_WOPI_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_WOPI_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_WOPI_ACCESS_TOKENS",
        help = "Comma separated access tokens accepted by the host (any non-blank token if unset)"
    )]
    pub access_tokens: Option<String>,
    #[arg(
        long,
        env = "AXO_WOPI_PUBLIC_URL",
        help = "Public base URL used for generated file URLs"
    )]
    pub public_url: Option<String>,
    #[arg(
        long,
        env = "AXO_WOPI_HOST_VIEW_URL",
        help = "Host view page URL, `{name}` is replaced by the file name"
    )]
    pub host_view_url: Option<String>,
    #[arg(
        long,
        env = "AXO_WOPI_HOST_EDIT_URL",
        help = "Host edit page URL, `{name}` is replaced by the file name"
    )]
    pub host_edit_url: Option<String>,
    #[arg(long, env = "AXO_WOPI_CLOSE_URL", help = "URL the editor navigates to on close")]
    pub close_url: Option<String>,
    #[arg(
        long,
        env = "AXO_WOPI_BRAND_NAME",
        default_value = DEFAULT_BRAND_NAME,
        help = "Breadcrumb brand name"
    )]
    pub brand_name: String,
    #[arg(
        long,
        env = "AXO_WOPI_OWNER_ID",
        default_value = DEFAULT_OWNER_ID,
        help = "Owner id reported for every file"
    )]
    pub owner_id: String,
    #[arg(
        long,
        env = "AXO_WOPI_USER_ID",
        default_value = DEFAULT_USER_ID,
        help = "User id reported to the editor"
    )]
    pub user_id: String,
    #[arg(
        long,
        env = "AXO_WOPI_USER_FRIENDLY_NAME",
        default_value = DEFAULT_USER_FRIENDLY_NAME,
        help = "Display name reported to the editor"
    )]
    pub user_friendly_name: String,
    #[arg(
        long,
        env = "AXO_WOPI_LEASE_TTL_SECS",
        default_value_t = DEFAULT_LEASE_TTL_SECS,
        help = "Lock lease lifetime in seconds"
    )]
    pub lease_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_WOPI_LEASE_PRUNE_INTERVAL_SECS",
        default_value_t = DEFAULT_LEASE_PRUNE_INTERVAL_SECS,
        help = "Expired lease sweep interval in seconds (0 to disable)"
    )]
    pub lease_prune_interval_secs: u64,
}

impl Args {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// 解析逗号分隔的访问令牌列表，空列表表示不做白名单限制。
    pub fn access_token_list(&self) -> Vec<String> {
        self.access_tokens
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            public_url: self
                .public_url
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_string()),
            host_view_url: self.host_view_url.clone(),
            host_edit_url: self.host_edit_url.clone(),
            close_url: self.close_url.clone(),
            brand_name: self.brand_name.clone(),
            owner_id: self.owner_id.clone(),
            user_id: self.user_id.clone(),
            user_friendly_name: self.user_friendly_name.clone(),
        }
    }
}

/// 宿主品牌与页面地址配置，用于 CheckFileInfo 与 PutRelativeFile 响应体。
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub public_url: Option<String>,
    pub host_view_url: Option<String>,
    pub host_edit_url: Option<String>,
    pub close_url: Option<String>,
    pub brand_name: String,
    pub owner_id: String,
    pub user_id: String,
    pub user_friendly_name: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            public_url: None,
            host_view_url: None,
            host_edit_url: None,
            close_url: None,
            brand_name: DEFAULT_BRAND_NAME.to_string(),
            owner_id: DEFAULT_OWNER_ID.to_string(),
            user_id: DEFAULT_USER_ID.to_string(),
            user_friendly_name: DEFAULT_USER_FRIENDLY_NAME.to_string(),
        }
    }
}

impl HostConfig {
    /// 将页面模板中的 `{name}` 替换为编码后的文件名。
    pub fn host_page_url(template: Option<&str>, name: &str) -> Option<String> {
        let encoded = crate::operation::encode_id(name);
        template.map(|value| value.replace("{name}", &encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_list_skips_blank_entries() {
        let args = Args::parse_from(["axo-wopi", "--access-tokens", "alpha, ,beta,"]);
        assert_eq!(args.access_token_list(), vec!["alpha", "beta"]);
        assert_eq!(args.lease_ttl(), Duration::from_secs(DEFAULT_LEASE_TTL_SECS));
    }

    #[test]
    fn host_page_url_substitutes_encoded_name() {
        let url = HostConfig::host_page_url(Some("https://host/edit?file={name}"), "a b.docx");
        assert_eq!(url.as_deref(), Some("https://host/edit?file=a%20b.docx"));
        assert_eq!(HostConfig::host_page_url(None, "doc"), None);
    }
}
