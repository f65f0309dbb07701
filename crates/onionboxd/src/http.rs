//! Package upload/download endpoints.
//!
//!   POST /        - multipart upload, responds with the share link
//!   GET  /{name}  - download an unencrypted package (401 if encrypted)
//!   POST /{name}  - download an encrypted package, form field `password`

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use bytes::Bytes;
use onionbox_buffer::{
    names, BufferStore, ChunkPipeline, DestroyReason, FileSource, Package, PipelineOptions,
    PublishOptions,
};
use onionbox_core::config::OnionboxConfig;
use onionbox_core::BoxError;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BufferStore>,
    pub config: Arc<OnionboxConfig>,
    pub metrics: Metrics,
    /// Parent token for every upload pipeline; fired at shutdown.
    pub cancel: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.upload.max_form_mb)
        .unwrap_or(usize::MAX)
        .saturating_mul(1024 * 1024);

    Router::new()
        .route("/", post(upload))
        .route("/{name}", get(download).post(download_with_password))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// HTTP status for each error kind.
pub trait HttpStatus {
    fn status(&self) -> StatusCode;
}

impl HttpStatus for BoxError {
    fn status(&self) -> StatusCode {
        match self {
            BoxError::NotFound => StatusCode::NOT_FOUND,
            BoxError::LimitReached => StatusCode::GONE,
            BoxError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            BoxError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            BoxError::NameCollision(_) => StatusCode::SERVICE_UNAVAILABLE,
            BoxError::IntegrityFailed
            | BoxError::PinningFailed(_)
            | BoxError::Io(_)
            | BoxError::Crypto(_)
            | BoxError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Box(#[from] BoxError),

    /// Malformed request; the message is shown to the client as-is.
    #[error("bad request: {0}")]
    BadRequest(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Box(e) => (e.status(), e.user_message()).into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        }
    }
}

// ── Upload ───────────────────────────────────────────────────────────────────

async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<String, ApiError> {
    let timeout = Duration::from_secs(state.config.upload.timeout_secs);
    let result = match tokio::time::timeout(timeout, receive_upload(&state, multipart)).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Box(BoxError::Cancelled)),
    };

    match result {
        Ok(name) => {
            state.metrics.uploads.inc();
            if let Some(live) = state.store.try_len() {
                state.metrics.set_live(live);
            }
            let base = state.config.daemon.public_url.trim_end_matches('/');
            Ok(format!("{base}/{name}"))
        }
        Err(e) => {
            match &e {
                ApiError::Box(err) => warn!(kind = %err.kind(), error = %err, "upload failed"),
                ApiError::BadRequest(msg) => debug!(reason = msg, "upload rejected"),
            }
            Err(e)
        }
    }
}

async fn receive_upload(state: &AppState, mut multipart: Multipart) -> Result<String, ApiError> {
    let options = PipelineOptions::from_config(&state.config);
    let pipe_capacity = options.chunk_size.max(1);
    let pipeline = ChunkPipeline::start(options, &state.cancel);

    let form = match read_form(&pipeline, &mut multipart, pipe_capacity).await {
        Ok(form) => form,
        Err(e) => return Err(abandon(pipeline, e).await),
    };
    let publish = match form.into_publish_options() {
        Ok(publish) => publish,
        Err(e) => {
            pipeline.abort().await;
            return Err(e);
        }
    };

    let archive = pipeline.finish().await?;
    Ok(state.store.publish(archive, publish).await?)
}

/// Drain the multipart body: file parts stream into the pipeline, the rest
/// are collected as form options.
async fn read_form(
    pipeline: &ChunkPipeline,
    multipart: &mut Multipart,
    pipe_capacity: usize,
) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    while let Some(mut field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(key) = field.name().map(str::to_owned) else {
            continue;
        };
        if key == "files" {
            let file_name = field.file_name().unwrap_or_default().to_owned();
            // Browsers send an unnamed, empty part when no file was chosen.
            let first = if file_name.is_empty() {
                match field.chunk().await.map_err(bad_multipart)? {
                    Some(chunk) => Some(chunk),
                    None => {
                        debug!("skipping empty unnamed file part");
                        continue;
                    }
                }
            } else {
                None
            };
            let (reader, writer) = tokio::io::duplex(pipe_capacity);
            pipeline.submit(FileSource::new(file_name, reader)).await?;
            pump_field(field, first, writer).await?;
            form.files += 1;
        } else {
            let value = field.text().await.map_err(bad_multipart)?;
            form.set(&key, value);
        }
    }
    Ok(form)
}

async fn pump_field(
    mut field: Field<'_>,
    first: Option<Bytes>,
    mut writer: DuplexStream,
) -> Result<u64, ApiError> {
    let mut total = 0u64;
    if let Some(chunk) = first {
        writer.write_all(&chunk).await.map_err(BoxError::from)?;
        total += chunk.len() as u64;
    }
    while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
        writer.write_all(&chunk).await.map_err(BoxError::from)?;
        total += chunk.len() as u64;
    }
    writer.shutdown().await.map_err(BoxError::from)?;
    Ok(total)
}

/// Tear down a pipeline after a failed upload and pick the error to report.
async fn abandon(pipeline: ChunkPipeline, err: ApiError) -> ApiError {
    match err {
        // A stopped worker shows up as a broken pipe; report its own error.
        ApiError::Box(BoxError::Io(ref e)) if e.kind() == io::ErrorKind::BrokenPipe => {
            match pipeline.finish().await {
                Err(worker) => worker.into(),
                Ok(_) => err,
            }
        }
        _ => {
            pipeline.abort().await;
            err
        }
    }
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> ApiError {
    debug!(error = %e, "multipart parse failed");
    ApiError::BadRequest("Error parsing files.")
}

#[derive(Default)]
struct UploadForm {
    files: usize,
    password_enabled: bool,
    password: Option<SecretString>,
    limit_downloads: bool,
    download_limit: Option<String>,
    expire: bool,
    expiration_time: Option<String>,
}

impl UploadForm {
    fn set(&mut self, key: &str, value: String) {
        match key {
            "password_enabled" => self.password_enabled = value == "on",
            "password" => self.password = Some(SecretString::from(value)),
            "limit_downloads" => self.limit_downloads = value == "on",
            "download_limit" => self.download_limit = Some(value),
            "expire" => self.expire = value == "on",
            "expiration_time" => self.expiration_time = Some(value),
            _ => debug!(field = key, "ignoring unknown form field"),
        }
    }

    fn into_publish_options(self) -> Result<PublishOptions, ApiError> {
        if self.files == 0 {
            return Err(ApiError::BadRequest("No files were uploaded."));
        }

        let passphrase = if self.password_enabled {
            match self.password {
                Some(p) if !p.expose_secret().is_empty() => Some(p),
                _ => return Err(ApiError::BadRequest("A password is required.")),
            }
        } else {
            None
        };

        let download_limit = if self.limit_downloads {
            parse_number(self.download_limit.as_deref())
                .ok_or(ApiError::BadRequest("Error getting download limit."))?
        } else {
            0
        };

        let expires_in = if self.expire {
            let minutes = parse_number(self.expiration_time.as_deref())
                .ok_or(ApiError::BadRequest("Error parsing expiration time."))?;
            let secs = minutes
                .checked_mul(60)
                .ok_or(ApiError::BadRequest("Error parsing expiration time."))?;
            Some(Duration::from_secs(secs))
        } else {
            None
        };

        Ok(PublishOptions {
            passphrase,
            download_limit,
            expires_in,
        })
    }
}

fn parse_number(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse().ok())
}

// ── Download ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PasswordForm {
    #[serde(default)]
    password: String,
}

async fn download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !names::is_valid(&name) {
        return Err(BoxError::NotFound.into());
    }

    match state.store.get(&name).await {
        Ok(buffer) if buffer.is_encrypted() => {
            state.metrics.record_download("password_required");
            return Ok((
                StatusCode::UNAUTHORIZED,
                "This file is password protected. POST the password to this URL.",
            )
                .into_response());
        }
        Ok(_) => {}
        Err(e) => {
            state.metrics.record_download(e.kind().as_str());
            return Err(e.into());
        }
    }

    finish_download(&state, &name, None).await
}

async fn download_with_password(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Form(form): Form<PasswordForm>,
) -> Result<Response, ApiError> {
    if !names::is_valid(&name) {
        return Err(BoxError::NotFound.into());
    }
    let passphrase = SecretString::from(form.password);
    finish_download(&state, &name, Some(&passphrase)).await
}

async fn finish_download(
    state: &AppState,
    name: &str,
    passphrase: Option<&SecretString>,
) -> Result<Response, ApiError> {
    let result = state.store.download(name, passphrase).await;
    if let Some(live) = state.store.try_len() {
        state.metrics.set_live(live);
    }

    match result {
        Ok(package) => {
            state.metrics.record_download("ok");
            if package.exhausted {
                state.metrics.record_destroyed(DestroyReason::LimitReached, 1);
            }
            info!(
                name = %package.name,
                downloads = package.downloads,
                exhausted = package.exhausted,
                "package downloaded"
            );
            Ok(package_response(package))
        }
        Err(e) => {
            state.metrics.record_download(e.kind().as_str());
            if e.is_terminal() {
                warn!(name = %name, kind = %e.kind(), "download refused");
            } else {
                debug!(name = %name, kind = %e.kind(), error = %e, "download failed");
            }
            Err(e.into())
        }
    }
}

/// Stream the package straight from its pinned region; the region is wiped
/// when the body is dropped.
fn package_response(package: Package) -> Response {
    let disposition = format!("attachment; filename={}", package.file_name());
    let content_type = package.content_type();
    let body = Body::from(Bytes::from_owner(package.bytes));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use onionbox_buffer::StoreOptions;
    use prometheus_client::registry::Registry;
    use tower::ServiceExt;

    const BOUNDARY: &str = "onionboxtestboundary";

    fn test_config() -> OnionboxConfig {
        let mut config = OnionboxConfig::default();
        config.daemon.public_url = "http://example.onion/".into();
        config.store.require_pinning = false;
        config.crypto.argon2_mem_cost_kib = 1024;
        config.crypto.argon2_time_cost = 1;
        config.crypto.argon2_parallelism = 1;
        config
    }

    fn test_state() -> AppState {
        let config = test_config();
        let mut registry = Registry::default();
        AppState {
            store: Arc::new(BufferStore::new(StoreOptions::from_config(&config))),
            config: Arc::new(config),
            metrics: Metrics::register(&mut registry),
            cancel: CancellationToken::new(),
        }
    }

    enum Part<'a> {
        File(&'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::File(name, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
                Part::Text(key, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{key}\"\r\n\r\n{value}")
                            .as_bytes(),
                    );
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Response) {
        let response = app.clone().oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    async fn upload_parts(app: &Router, parts: &[Part<'_>]) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();
        let (status, response) = send(app, request).await;
        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        (status, text)
    }

    fn name_from_link(link: &str) -> String {
        link.rsplit('/').next().unwrap().to_string()
    }

    fn get(name: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/{name}"))
            .body(Body::empty())
            .unwrap()
    }

    fn post_password(name: &str, password: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/{name}"))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("password={password}")))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_then_get_returns_zip() {
        let app = router(test_state());
        let (status, link) = upload_parts(
            &app,
            &[
                Part::File("a.txt", b"0123456789"),
                Part::File("b.txt", b"abcdefghijklmnopqrst"),
            ],
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{link}");
        assert!(link.starts_with("http://example.onion/"));
        let name = name_from_link(&link);
        assert!(names::is_valid(&name));

        let (status, response) = send(&app, get(&name)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/zip"
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            format!("attachment; filename={name}.zip").as_str()
        );
        let bytes = body_bytes(response).await;
        assert!(bytes.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn password_protected_single_download() {
        let app = router(test_state());
        let (status, link) = upload_parts(
            &app,
            &[
                Part::File("secret.txt", b"classified"),
                Part::Text("password_enabled", "on"),
                Part::Text("password", "secret123"),
                Part::Text("limit_downloads", "on"),
                Part::Text("download_limit", "1"),
            ],
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{link}");
        let name = name_from_link(&link);

        let (status, _) = send(&app, get(&name)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, post_password(&name, "nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, response) = send(&app, post_password(&name, "secret123")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body_bytes(response).await.starts_with(b"PK"));

        let (status, _) = send(&app, post_password(&name, "secret123")).await;
        assert!(status == StatusCode::NOT_FOUND || status == StatusCode::GONE);
    }

    #[tokio::test]
    async fn invalid_names_are_not_found() {
        let app = router(test_state());
        for name in ["UPPER", "with-dash", "nosuchpackage"] {
            let (status, _) = send(&app, get(name)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{name}");
        }
    }

    #[tokio::test]
    async fn malformed_options_are_rejected() {
        let state = test_state();
        let store = state.store.clone();
        let app = router(state);

        let (status, _) = upload_parts(
            &app,
            &[
                Part::File("a.txt", b"data"),
                Part::Text("limit_downloads", "on"),
                Part::Text("download_limit", "many"),
            ],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = upload_parts(
            &app,
            &[
                Part::File("a.txt", b"data"),
                Part::Text("password_enabled", "on"),
            ],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = upload_parts(&app, &[Part::Text("expire", "on")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn cancelled_daemon_refuses_uploads() {
        let state = test_state();
        state.cancel.cancel();
        let app = router(state);

        let (status, body) = upload_parts(&app, &[Part::File("a.txt", b"data")]).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body, BoxError::Cancelled.user_message());
    }

    #[tokio::test]
    async fn empty_unnamed_file_part_is_not_a_file() {
        let state = test_state();
        let store = state.store.clone();
        let app = router(state);

        let (status, body) = upload_parts(&app, &[Part::File("", b"")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "No files were uploaded.");
        assert!(store.is_empty().await);

        let (status, link) = upload_parts(
            &app,
            &[Part::File("", b""), Part::File("notes.txt", b"hello")],
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{link}");
        let (_, response) = send(&app, get(&name_from_link(&link))).await;
        let bytes = body_bytes(response).await;
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.by_index(0).unwrap().name(), "notes.txt");
    }

    #[tokio::test]
    async fn stalled_upload_hits_deadline() {
        let mut config = test_config();
        config.upload.timeout_secs = 1;
        let mut state = test_state();
        state.config = Arc::new(config);
        let store = state.store.clone();
        let app = router(state);

        // Send the start of a file part, then keep the connection open.
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(
                format!(
                    "--{BOUNDARY}\r\n\
                     Content-Disposition: form-data; name=\"files\"; filename=\"slow.txt\"\r\n\r\n\
                     partial"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from_stream(tokio_util::io::ReaderStream::new(server)))
            .unwrap();

        let (status, response) = send(&app, request).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        let body = body_bytes(response).await;
        assert_eq!(body.as_ref(), BoxError::Cancelled.user_message().as_bytes());
        assert!(store.is_empty().await);
        drop(client);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(BoxError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(BoxError::LimitReached.status(), StatusCode::GONE);
        assert_eq!(
            BoxError::AuthenticationFailed.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            BoxError::IntegrityFailed.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            BoxError::NameCollision("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(BoxError::Cancelled.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
