//! HTTPS 监听器的证书：优先使用配置的 PEM 文件，缺省时生成自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

const SELF_SIGNED_CERT_FILE: &str = "axo-wopi-cert.pem";
const SELF_SIGNED_KEY_FILE: &str = "axo-wopi-key.pem";

/// 构建 Rustls 配置；证书与私钥必须成对提供。
pub async fn build_rustls_config(
    tls_cert: Option<&str>,
    tls_key: Option<&str>,
    host: IpAddr,
) -> io::Result<RustlsConfig> {
    let (cert_path, key_path) = match (tls_cert, tls_key) {
        (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
        (None, None) => write_self_signed(&std::env::temp_dir(), host).await?,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tls cert and key must be configured together",
            ));
        }
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

/// 为绑定地址与 localhost 生成自签名证书，写入 `dir` 并返回文件路径。
async fn write_self_signed(dir: &Path, host: IpAddr) -> io::Result<(PathBuf, PathBuf)> {
    let mut names = vec![host.to_string()];
    if !host.is_loopback() {
        names.push("localhost".to_string());
    }
    let generated = generate_simple_self_signed(names)
        .map_err(|err| io::Error::other(err.to_string()))?;

    let cert_path = dir.join(SELF_SIGNED_CERT_FILE);
    let key_path = dir.join(SELF_SIGNED_KEY_FILE);
    fs::write(&cert_path, generated.cert.pem()).await?;
    fs::write(&key_path, generated.key_pair.serialize_pem()).await?;
    info!(cert = %cert_path.display(), "generated self-signed certificate");
    Ok((cert_path, key_path))
}
