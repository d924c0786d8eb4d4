use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use futures::TryStreamExt;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::relay::relay_batch;
use crate::storage::{remove_all, remove_temp_file, SpoolError, SpooledBatch};
use crate::AppState;

/// Handle `POST /upload`
///
/// Spools every file part under the configured field to the scratch
/// directory, then relays the batch. Whatever happens, no temp file of the
/// request outlives it.
pub async fn upload_files(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<&'static str, RelayError> {
    info!("Received upload request");

    // Runs detached from the connection: a client that goes away does not
    // cancel uploads already in flight
    tokio::spawn(process_upload(state, multipart))
        .await
        .map_err(|e| {
            error!("Upload task failed: {}", e);
            RelayError::Internal(e.to_string())
        })?
}

async fn process_upload(
    state: AppState,
    mut multipart: Multipart,
) -> Result<&'static str, RelayError> {
    let mut batch = SpooledBatch::default();
    if let Err(e) = collect_files(&state, &mut multipart, &mut batch).await {
        warn!("Rejecting upload: {}", e);
        remove_all(batch.files()).await;
        return Err(e);
    }

    if batch.is_empty() {
        warn!("Upload request carried no files");
        return Err(RelayError::NoFiles);
    }

    info!(
        "Received {} file(s): {:?}",
        batch.len(),
        batch
            .files()
            .iter()
            .map(|f| f.original_name.as_str())
            .collect::<Vec<_>>()
    );

    relay_batch(state.provider.as_ref(), batch.files(), &state.relay_options).await?;

    Ok(state.config.upload.mode.success_message())
}

async fn collect_files(
    state: &AppState,
    multipart: &mut Multipart,
    batch: &mut SpooledBatch,
) -> Result<(), RelayError> {
    let upload = &state.config.upload;
    let expected_field = upload.mode.field_name();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(RelayError::from_multipart)?
    {
        if field.name() != Some(expected_field) {
            debug!("Ignoring form field {:?}", field.name());
            continue;
        }

        let Some(original_name) = field.file_name().map(str::to_string) else {
            debug!("Ignoring non-file part under '{}'", expected_field);
            continue;
        };

        if let Some(limit) = upload.max_files {
            if batch.len() >= limit {
                return Err(RelayError::TooManyFiles { limit });
            }
        }

        let content_type = field.content_type().and_then(normalize_content_type);

        let file = state
            .temp_store
            .spool(&original_name, content_type, field.map_err(spool_error))
            .await
            .map_err(|e| RelayError::from_spool(&original_name, e))?;

        // An empty file input still submits a part with no name and no bytes
        if file.original_name.is_empty() && file.size == 0 {
            remove_temp_file(&file.temp_path).await;
            continue;
        }

        batch.push(file);
    }

    Ok(())
}

fn spool_error(err: MultipartError) -> SpoolError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        SpoolError::BodyTooLarge
    } else {
        SpoolError::Stream(err.body_text())
    }
}

/// Keep a client-declared content type only if it parses as a MIME type
fn normalize_content_type(raw: &str) -> Option<String> {
    raw.parse::<mime::Mime>()
        .ok()
        .map(|m| m.essence_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DropboxConfig, ProviderConfig, ServerConfig, UploadConfig, UploadMode};
    use crate::providers::dropbox::DEFAULT_CONTENT_URL;
    use crate::providers::mock::RecordingProvider;
    use crate::providers::{ProviderError, RemoteObjectRef, StorageProvider, UploadRequest};
    use crate::build_router;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{header, Request},
        Router,
    };
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{Notify, Semaphore};
    use tower::ServiceExt;

    const BOUNDARY: &str = "relay-test-boundary";

    struct Harness<P> {
        router: Router,
        provider: Arc<P>,
        temp_dir: TempDir,
        _static_dir: TempDir,
    }

    /// Provider that holds every upload until the test hands out permits
    struct GatedProvider {
        started: Notify,
        gate: Semaphore,
        completed: AtomicUsize,
    }

    impl GatedProvider {
        fn new() -> Self {
            Self {
                started: Notify::new(),
                gate: Semaphore::new(0),
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageProvider for GatedProvider {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn upload(&self, request: UploadRequest) -> Result<RemoteObjectRef, ProviderError> {
            self.started.notify_one();
            self.gate
                .acquire()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?
                .forget();
            self.completed.fetch_add(1, Ordering::SeqCst);

            Ok(RemoteObjectRef {
                id: Some("abc123".to_string()),
                name: request.name,
                parent: request.parent,
            })
        }
    }

    fn upload_config(mode: UploadMode) -> UploadConfig {
        UploadConfig {
            mode,
            max_file_size_bytes: 64,
            max_files: match mode {
                UploadMode::Single => Some(1),
                UploadMode::Batch => None,
            },
            ..UploadConfig::default()
        }
    }

    fn harness(mode: UploadMode, provider: RecordingProvider) -> Harness<RecordingProvider> {
        harness_with(upload_config(mode), provider)
    }

    fn harness_with<P: StorageProvider + 'static>(mut upload: UploadConfig, provider: P) -> Harness<P> {
        let temp_dir = tempfile::tempdir().unwrap();
        let static_dir = tempfile::tempdir().unwrap();
        std::fs::write(static_dir.path().join("index.html"), "<h1>upload</h1>").unwrap();

        upload.temp_dir = temp_dir.path().to_path_buf();
        upload.static_dir = static_dir.path().to_path_buf();

        let config = Config {
            server: ServerConfig::default(),
            upload,
            provider: ProviderConfig::Dropbox(DropboxConfig {
                access_token: "sl.test".to_string(),
                upload_path: "/".to_string(),
                content_url: DEFAULT_CONTENT_URL.to_string(),
            }),
        };

        let provider = Arc::new(provider);
        let state = AppState::new(config, provider.clone()).unwrap();

        Harness {
            router: build_router(state),
            provider,
            temp_dir,
            _static_dir: static_dir,
        }
    }

    /// (field name, file name, content); `None` file name makes a plain text field
    fn multipart_request(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (field, file_name, content) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match file_name {
                Some(file_name) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
                            field, file_name
                        )
                        .as_bytes(),
                    );
                }
                None => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field).as_bytes(),
                    );
                }
            }
            body.extend_from_slice(content.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_normalize_content_type() {
        assert_eq!(
            normalize_content_type("text/plain; charset=utf-8").as_deref(),
            Some("text/plain")
        );
        assert_eq!(normalize_content_type("not a mime"), None);
    }

    #[tokio::test]
    async fn test_single_file_upload() {
        let h = harness(UploadMode::Single, RecordingProvider::succeeding("abc123"));

        let (status, body) = send(
            &h.router,
            multipart_request(&[("file", Some("photo.png"), "0123456789")]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "✅ File uploaded successfully!");

        let calls = h.provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "photo.png");
        assert_eq!(calls[0].content, Bytes::from_static(b"0123456789"));
        assert_eq!(calls[0].content_type.as_deref(), Some("image/png"));
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_no_files_is_client_error() {
        let h = harness(UploadMode::Single, RecordingProvider::succeeding("abc123"));

        let (status, body) = send(&h.router, multipart_request(&[("note", None, "hello")])).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "❌ No file uploaded");
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_field_name_counts_as_no_files() {
        let h = harness(UploadMode::Single, RecordingProvider::succeeding("abc123"));

        let (status, _) = send(
            &h.router,
            multipart_request(&[("photo", Some("photo.png"), "data")]),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_empty_file_input_is_ignored() {
        let h = harness(UploadMode::Single, RecordingProvider::succeeding("abc123"));

        let (status, _) = send(&h.router, multipart_request(&[("file", Some(""), "")])).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_batch_upload_all_succeed() {
        let h = harness(UploadMode::Batch, RecordingProvider::succeeding("abc123"));

        let (status, body) = send(
            &h.router,
            multipart_request(&[
                ("photo", Some("a.png"), "aaa"),
                ("caption", None, "holiday"),
                ("photo", Some("b.png"), "bbb"),
                ("photo", Some("c.png"), "ccc"),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "✅ All files uploaded successfully!");
        let names: Vec<String> = h.provider.calls().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a.png", "b.png", "c.png"]);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_batch_failure_reports_provider_text() {
        let h = harness(
            UploadMode::Batch,
            RecordingProvider::failing_on(2, "quota_exceeded"),
        );

        let (status, body) = send(
            &h.router,
            multipart_request(&[
                ("photo", Some("a.png"), "aaa"),
                ("photo", Some("b.png"), "bbb"),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("quota_exceeded"));
        assert_eq!(body, "❌ Upload failed: quota_exceeded");
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_second_file_in_single_mode_rejected() {
        let h = harness(UploadMode::Single, RecordingProvider::succeeding("abc123"));

        let (status, _) = send(
            &h.router,
            multipart_request(&[
                ("file", Some("a.png"), "aaa"),
                ("file", Some("b.png"), "bbb"),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_oversized_file_rejected() {
        let h = harness(UploadMode::Batch, RecordingProvider::succeeding("abc123"));
        let big = "x".repeat(65);

        let (status, body) = send(
            &h.router,
            multipart_request(&[
                ("photo", Some("small.png"), "ok"),
                ("photo", Some("big.png"), big.as_str()),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body.contains("big.png"));
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_health_and_static_frontend() {
        let h = harness(UploadMode::Single, RecordingProvider::succeeding("abc123"));

        let health = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&h.router, health).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Upload relay is healthy");

        let index = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(&h.router, index).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<h1>upload</h1>");
    }

    #[tokio::test]
    async fn test_large_batch_is_not_capped() {
        let h = harness(UploadMode::Batch, RecordingProvider::succeeding("abc123"));
        let names: Vec<String> = (0..11).map(|i| format!("photo-{}.png", i)).collect();
        let parts: Vec<(&str, Option<&str>, &str)> = names
            .iter()
            .map(|name| ("photo", Some(name.as_str()), "data"))
            .collect();

        let (status, body) = send(&h.router, multipart_request(&parts)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "✅ All files uploaded successfully!");
        assert_eq!(h.provider.call_count(), 11);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_request_over_body_limit_is_payload_too_large() {
        let mut upload = upload_config(UploadMode::Batch);
        upload.max_request_size_bytes = Some(200);
        let h = harness_with(upload, RecordingProvider::succeeding("abc123"));
        let content = "x".repeat(40);

        let (status, _) = send(
            &h.router,
            multipart_request(&[
                ("photo", Some("a.png"), content.as_str()),
                ("photo", Some("b.png"), content.as_str()),
                ("photo", Some("c.png"), content.as_str()),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_does_not_strand_temp_files() {
        let h = harness_with(upload_config(UploadMode::Batch), GatedProvider::new());
        let response = h.router.clone().oneshot(multipart_request(&[
            ("photo", Some("a.png"), "aaa"),
            ("photo", Some("b.png"), "bbb"),
            ("photo", Some("c.png"), "ccc"),
        ]));

        // hang up once the first upload has reached the provider
        tokio::select! {
            _ = response => panic!("request finished while the provider was held"),
            _ = h.provider.started.notified() => {}
        }

        h.provider.gate.add_permits(3);
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.provider.completed.load(Ordering::SeqCst) < 3 || entries(h.temp_dir.path()) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay did not finish after the client went away");

        assert_eq!(h.provider.completed.load(Ordering::SeqCst), 3);
        assert_eq!(entries(h.temp_dir.path()), 0);
    }
}
