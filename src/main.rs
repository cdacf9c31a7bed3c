//! AxoWopi server binary.
//!
//! A WOPI host: office editors reach files under `/wopi/files/<id>` and the
//! server answers CheckFileInfo, GetFile, PutFile, PutRelativeFile and the
//! lock family against a local storage directory. Locks live in an in-process
//! lease table that expires entries after the configured lifetime.

mod access;
mod atomic;
mod background;
mod config;
mod error;
mod gateway;
mod http;
mod info;
mod lease;
mod logging;
mod operation;
mod storage;
mod tls;
mod version;
mod wopi;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::access::{AcceptAllProofs, AccessGate, ProofValidator, TokenPolicy};
use crate::background::spawn_background_tasks;
use crate::config::{Args, HostConfig};
use crate::gateway::FileGateway;
use crate::http::{RequestScheme, build_cors_layer, resolve_client_ip};
use crate::lease::LeaseTable;
use crate::storage::Storage;

shadow!(build);

/// Starts the WOPI host and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    let leases = Arc::new(LeaseTable::new(args.lease_ttl()));
    let gateway = Arc::new(FileGateway::new(storage.clone(), leases.clone()));
    let host_config = Arc::new(args.host_config());
    let access_tokens = args.access_token_list();
    if !access_tokens.is_empty() {
        info!(count = access_tokens.len(), "access token allow-list enabled");
    }
    let gate: Arc<dyn AccessGate> = Arc::new(TokenPolicy::new(access_tokens));
    let proofs: Arc<dyn ProofValidator> = Arc::new(AcceptAllProofs);

    let mut app = build_router(gateway, host_config, gate, proofs);
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https_addr = SocketAddr::new(host, args.https_port);
    let tls_config =
        tls::build_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref(), host).await?;
    let handle = Handle::new();

    info!(storage = %storage.root_path().display(), "serving WOPI files");
    info!("Starting HTTP server at {}", http_addr);
    info!("Starting HTTPS server at {}", https_addr);

    let http_app = app.clone().layer(Extension(RequestScheme::Http));
    let https_app = app.layer(Extension(RequestScheme::Https));

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(http_app.into_make_service_with_connect_info::<SocketAddr>());
    let https_server = axum_server::bind_rustls(https_addr, tls_config)
        .handle(handle.clone())
        .serve(https_app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(
        leases,
        Duration::from_secs(args.lease_prune_interval_secs),
    );
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// 组装路由：WOPI 请求全部由 fallback 处理器分类，`RequestScheme` 由调用方按监听器注入。
fn build_router(
    gateway: Arc<FileGateway>,
    host_config: Arc<HostConfig>,
    gate: Arc<dyn AccessGate>,
    proofs: Arc<dyn ProofValidator>,
) -> Router {
    Router::new()
        .route("/api/version", get(version::get_version_info))
        .fallback(wopi::wopi_handler)
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(gateway))
        .layer(Extension(host_config))
        .layer(Extension(gate))
        .layer(Extension(proofs))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
