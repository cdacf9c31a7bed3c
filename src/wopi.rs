//! WOPI 请求入口：校验、分类、鉴权后分派到租约表与文件网关。

use axum::body::Body as AxumBody;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::access::{AccessGate, ProofValidator};
use crate::config::{HEADER_ITEM_VERSION, HEADER_OLD_LOCK, HostConfig};
use crate::error::{WopiError, insert_header};
use crate::gateway::FileGateway;
use crate::http::{RequestScheme, request_base_url};
use crate::info::{CheckFileInfoResponse, PutRelativeFileResponse};
use crate::lease::LockMismatch;
use crate::operation::{Operation, WopiRequest, classify};
use crate::storage::{FileRecord, StorageError, content_sha256};

#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    access_token: Option<String>,
}

/// 所有 `/wopi/` 请求的统一处理器。
#[allow(clippy::too_many_arguments)]
pub async fn wopi_handler(
    Extension(gateway): Extension<Arc<FileGateway>>,
    Extension(host): Extension<Arc<HostConfig>>,
    Extension(gate): Extension<Arc<dyn AccessGate>>,
    Extension(proofs): Extension<Arc<dyn ProofValidator>>,
    Extension(scheme): Extension<RequestScheme>,
    query: Result<Query<AccessQuery>, QueryRejection>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<Response, WopiError> {
    if !proofs.validate(&method, &uri, &headers) {
        warn!(path = uri.path(), "proof key validation failed");
        return Err(WopiError::ProofKeyInvalid);
    }

    // 无法解析的查询串（例如重复的 access_token）按缺少令牌处理。
    let access_token = query.ok().and_then(|Query(query)| query.access_token);
    let request = classify(&method, uri.path(), &headers, access_token);
    let operation = request.operation;
    if operation == Operation::None {
        return Err(WopiError::Internal(format!(
            "unclassified request: {method} {}",
            uri.path()
        )));
    }
    if !operation.is_executable() {
        debug!(operation = operation.name(), file_id = %request.id, "operation not implemented");
        return Err(WopiError::Unsupported(operation.name()));
    }

    let token = request.access_token.as_deref().unwrap_or_default();
    if !gate.check_access(token, operation.requires_write()) {
        debug!(operation = operation.name(), file_id = %request.id, "access denied");
        return Err(WopiError::InvalidToken);
    }

    match operation {
        Operation::CheckFileInfo => {
            let base_url = request_base_url(host.public_url.as_deref(), &headers, scheme);
            check_file_info(&gateway, &host, &base_url, &request.id).await
        }
        Operation::GetFile => get_file(&gateway, &request.id).await,
        Operation::PutFile => {
            let record = gateway
                .put_file(&request.id, request.lock.as_deref(), body)
                .await?;
            Ok(version_response(&record))
        }
        Operation::PutRelativeFile => {
            let base_url = request_base_url(host.public_url.as_deref(), &headers, scheme);
            let record = gateway
                .put_relative_file(&request.id, &request.targets, request.lock.as_deref(), body)
                .await?;
            let payload = PutRelativeFileResponse::new(&record, &host, &base_url, token);
            let mut response = JsonResponse(payload).into_response();
            insert_header(response.headers_mut(), HEADER_ITEM_VERSION, &record.version);
            Ok(response)
        }
        Operation::Lock
        | Operation::Unlock
        | Operation::RefreshLock
        | Operation::UnlockAndRelock => lock_operation(&gateway, &request).await,
        _ => Err(WopiError::Unsupported(operation.name())),
    }
}

async fn check_file_info(
    gateway: &FileGateway,
    host: &HostConfig,
    base_url: &str,
    id: &str,
) -> Result<Response, WopiError> {
    let (mut file, record) = gateway.get_file(id).await?;
    let sha256 = content_sha256(&mut file)
        .await
        .map_err(StorageError::Io)?;
    debug!(file_id = id, size = record.size, version = %record.version, "check file info");
    Ok(JsonResponse(CheckFileInfoResponse::new(&record, host, base_url, sha256)).into_response())
}

async fn get_file(gateway: &FileGateway, id: &str) -> Result<Response, WopiError> {
    let (file, record) = gateway.get_file(id).await?;
    let mime = mime_guess::from_path(&record.path).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| WopiError::Internal("invalid mime type".into()))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size));
    if let Some(modified) = record.modified {
        insert_header(&mut headers, "last-modified", &fmt_http_date(modified));
    }
    insert_header(&mut headers, HEADER_ITEM_VERSION, &record.version);

    debug!(file_id = id, size = record.size, "get file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Lock, Unlock, RefreshLock and UnlockAndRelock on an existing file.
async fn lock_operation(
    gateway: &FileGateway,
    request: &WopiRequest,
) -> Result<Response, WopiError> {
    let id = request.id.as_str();
    let lock = request
        .lock
        .as_deref()
        .filter(|lock| !lock.is_empty())
        .ok_or_else(|| WopiError::BadRequest("X-WOPI-Lock header is required".into()))?;
    gateway.stat(id).await?;

    let leases = gateway.leases();
    let result = match request.operation {
        Operation::Lock => leases.lock(id, lock).await,
        Operation::Unlock => leases.unlock(id, lock).await,
        Operation::RefreshLock => leases.refresh(id, lock).await,
        Operation::UnlockAndRelock => {
            let old_lock = request.old_lock.as_deref().unwrap_or_default();
            leases.unlock_and_relock(id, old_lock, lock).await
        }
        other => return Err(WopiError::Unsupported(other.name())),
    };
    if let Err(mismatch) = result {
        log_lock_conflict(request, &mismatch);
        return Err(mismatch.into());
    }
    info!(operation = request.operation.name(), file_id = id, lock, "lease updated");

    match request.operation {
        Operation::Lock | Operation::Unlock => {
            let record = gateway.stat(id).await?;
            Ok(version_response(&record))
        }
        Operation::UnlockAndRelock => {
            let mut headers = HeaderMap::new();
            insert_header(&mut headers, HEADER_OLD_LOCK, lock);
            Ok((StatusCode::OK, headers).into_response())
        }
        _ => Ok(StatusCode::OK.into_response()),
    }
}

fn log_lock_conflict(request: &WopiRequest, mismatch: &LockMismatch) {
    debug!(
        operation = request.operation.name(),
        file_id = %request.id,
        requested = request.lock.as_deref().unwrap_or_default(),
        current = mismatch.current.as_deref().unwrap_or_default(),
        reason = mismatch.reason.as_deref().unwrap_or_default(),
        "lock conflict"
    );
}

fn version_response(record: &FileRecord) -> Response {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, HEADER_ITEM_VERSION, &record.version);
    (StatusCode::OK, headers).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AcceptAllProofs, TokenPolicy};
    use crate::config::{HEADER_LOCK, HEADER_LOCK_FAILURE_REASON, HEADER_OVERRIDE};
    use crate::lease::LeaseTable;
    use crate::storage::Storage;
    use axum::Router;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct RejectProofs;

    impl ProofValidator for RejectProofs {
        fn validate(&self, _method: &Method, _uri: &Uri, _headers: &HeaderMap) -> bool {
            false
        }
    }

    struct TestHost {
        _temp: tempfile::TempDir,
        storage: Arc<Storage>,
        app: Router,
    }

    impl TestHost {
        fn new() -> Self {
            Self::with_proofs(Arc::new(AcceptAllProofs))
        }

        fn with_proofs(proofs: Arc<dyn ProofValidator>) -> Self {
            let temp = tempdir().expect("tempdir");
            let root = temp.path().join("storage");
            std::fs::create_dir_all(&root).expect("create storage root");
            let storage = Arc::new(Storage::new(root));
            let leases = Arc::new(LeaseTable::new(Duration::from_secs(30 * 60)));
            let gateway = Arc::new(FileGateway::new(storage.clone(), leases));
            let app = crate::build_router(
                gateway,
                Arc::new(HostConfig::default()),
                Arc::new(TokenPolicy::default()),
                proofs,
            )
            .layer(Extension(RequestScheme::Http));
            Self {
                _temp: temp,
                storage,
                app,
            }
        }

        fn write(&self, name: &str, bytes: &[u8]) {
            std::fs::write(self.storage.root_path().join(name), bytes).expect("write fixture");
        }

        async fn send(
            &self,
            method: Method,
            uri: &str,
            headers: &[(&'static str, &str)],
            body: &'static [u8],
        ) -> Response {
            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header(header::HOST, "wopi.test");
            for (name, value) in headers {
                builder = builder.header(*name, *value);
            }
            let request = builder.body(AxumBody::from(body)).expect("request");
            self.app.clone().oneshot(request).await.expect("response")
        }

        async fn lock_op(&self, kind: &str, lock: &str) -> Response {
            self.send(
                Method::POST,
                "/wopi/files/doc1?access_token=tok",
                &[(HEADER_OVERRIDE, kind), (HEADER_LOCK, lock)],
                b"",
            )
            .await
        }
    }

    fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body")
            .to_vec()
    }

    #[tokio::test]
    async fn lock_conflict_unlock_and_relock_sequence() {
        let host = TestHost::new();
        host.write("doc1", b"content");

        let response = host.lock_op("LOCK", "L1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, HEADER_ITEM_VERSION).is_some());

        let response = host.lock_op("LOCK", "L2").await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(header(&response, HEADER_LOCK), Some("L1"));

        let response = host.lock_op("UNLOCK", "L1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, HEADER_ITEM_VERSION).is_some());

        let response = host.lock_op("LOCK", "L2").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unlock_on_unlocked_file_reports_reason() {
        let host = TestHost::new();
        host.write("doc1", b"content");

        let response = host.lock_op("UNLOCK", "L1").await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(header(&response, HEADER_LOCK), Some(""));
        assert_eq!(
            header(&response, HEADER_LOCK_FAILURE_REASON),
            Some("File not locked")
        );

        let response = host.lock_op("REFRESH_LOCK", "L1").await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unlock_and_relock_returns_new_lock_as_old_lock_header() {
        let host = TestHost::new();
        host.write("doc1", b"content");
        assert_eq!(host.lock_op("LOCK", "A").await.status(), StatusCode::OK);

        let response = host
            .send(
                Method::POST,
                "/wopi/files/doc1?access_token=tok",
                &[
                    (HEADER_OVERRIDE, "LOCK"),
                    (HEADER_LOCK, "B"),
                    (HEADER_OLD_LOCK, "A"),
                ],
                b"",
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, HEADER_OLD_LOCK), Some("B"));

        let response = host.lock_op("LOCK", "A").await;
        assert_eq!(header(&response, HEADER_LOCK), Some("B"));
        assert_eq!(host.lock_op("REFRESH_LOCK", "B").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_before_lease_changes() {
        let host = TestHost::new();
        host.write("doc1", b"content");

        for uri in [
            "/wopi/files/doc1",
            "/wopi/files/doc1?access_token=INVALID",
            "/wopi/files/doc1?access_token=a&access_token=b",
        ] {
            let response = host
                .send(
                    Method::POST,
                    uri,
                    &[(HEADER_OVERRIDE, "LOCK"), (HEADER_LOCK, "L1")],
                    b"",
                )
                .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert_eq!(host.lock_op("LOCK", "L2").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn put_then_get_returns_new_content_and_version() {
        let host = TestHost::new();
        host.write("doc1", b"old");
        let info = host
            .send(Method::GET, "/wopi/files/doc1?access_token=tok", &[], b"")
            .await;
        let info: serde_json::Value =
            serde_json::from_slice(&body_bytes(info).await).expect("json");
        let before = info["Version"].as_str().expect("version").to_string();

        assert_eq!(host.lock_op("LOCK", "A").await.status(), StatusCode::OK);
        let response = host
            .send(
                Method::POST,
                "/wopi/files/doc1/contents?access_token=tok",
                &[(HEADER_LOCK, "A")],
                b"new content",
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let written = header(&response, HEADER_ITEM_VERSION)
            .expect("item version")
            .to_string();
        assert_ne!(written, before);

        let response = host
            .send(Method::GET, "/wopi/files/doc1/contents?access_token=tok", &[], b"")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, HEADER_ITEM_VERSION), Some(written.as_str()));
        assert_eq!(body_bytes(response).await, b"new content");
    }

    #[tokio::test]
    async fn put_on_non_empty_unlocked_file_conflicts() {
        let host = TestHost::new();
        host.write("doc1", b"keep");
        let response = host
            .send(
                Method::POST,
                "/wopi/files/doc1/contents?access_token=tok",
                &[],
                b"clobber",
            )
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(header(&response, HEADER_LOCK), Some(""));
        assert!(header(&response, HEADER_LOCK_FAILURE_REASON).is_some());
        assert_eq!(
            std::fs::read(host.storage.root_path().join("doc1")).expect("read"),
            b"keep"
        );
    }

    #[tokio::test]
    async fn check_file_info_reports_protocol_fields() {
        let host = TestHost::new();
        host.write("report.docx", b"abc");
        let response = host
            .send(Method::GET, "/wopi/files/report.docx?access_token=tok", &[], b"")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let info: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).expect("json");
        assert_eq!(info["BaseFileName"], "report.docx");
        assert_eq!(info["Size"], 3);
        assert_eq!(info["SHA256"], "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=");
        assert_eq!(info["SupportsLocks"], true);
        assert_eq!(info["BreadcrumbBrandUrl"], "http://wopi.test");
    }

    #[tokio::test]
    async fn put_relative_file_returns_name_and_url() {
        let host = TestHost::new();
        host.write("doc1", b"source");
        let response = host
            .send(
                Method::POST,
                "/wopi/files/doc1?access_token=tok",
                &[(HEADER_OVERRIDE, "PUT_RELATIVE"), ("x-wopi-suggestedtarget", ".pdf")],
                b"converted",
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let version = header(&response, HEADER_ITEM_VERSION)
            .expect("item version")
            .to_string();
        let payload: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).expect("json");
        assert_eq!(payload["Name"], "doc1.pdf");
        assert_eq!(
            payload["Url"],
            "http://wopi.test/wopi/files/doc1.pdf?access_token=tok"
        );
        assert_eq!(
            std::fs::read(host.storage.root_path().join("doc1.pdf")).expect("read"),
            b"converted"
        );

        let info = host
            .send(Method::GET, "/wopi/files/doc1.pdf?access_token=tok", &[], b"")
            .await;
        let info: serde_json::Value =
            serde_json::from_slice(&body_bytes(info).await).expect("json");
        assert_eq!(info["Version"], version.as_str());
    }

    #[tokio::test]
    async fn missing_file_and_missing_lock_header() {
        let host = TestHost::new();
        let response = host
            .send(Method::GET, "/wopi/files/ghost?access_token=tok", &[], b"")
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        host.write("doc1", b"content");
        let response = host
            .send(
                Method::POST,
                "/wopi/files/doc1?access_token=tok",
                &[(HEADER_OVERRIDE, "LOCK")],
                b"",
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsupported_and_unclassified_requests() {
        let host = TestHost::new();
        let response = host
            .send(
                Method::POST,
                "/wopi/files/doc1?access_token=tok",
                &[(HEADER_OVERRIDE, "COBALT")],
                b"",
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

        let response = host
            .send(Method::GET, "/wopi/folders/f1/children?access_token=tok", &[], b"")
            .await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

        let response = host
            .send(Method::DELETE, "/wopi/files/doc1?access_token=tok", &[], b"")
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn failed_proof_validation_is_server_error_with_diagnostic() {
        let host = TestHost::with_proofs(Arc::new(RejectProofs));
        host.write("doc1", b"content");
        let response = host
            .send(Method::GET, "/wopi/files/doc1?access_token=tok", &[], b"")
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(header(&response, "x-wopi-handlerdiag").is_some());
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let host = TestHost::new();
        let response = host
            .send(Method::GET, "/wopi/files/ghost?access_token=tok", &[], b"")
            .await;
        assert_eq!(header(&response, "x-content-type-options"), Some("nosniff"));
    }
}
