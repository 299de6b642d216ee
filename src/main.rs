//! quickdrop server binary.
//!
//! A LAN file drop: browsers upload files through a multipart form, files
//! land in a single upload directory, and the index page lists them with
//! download and delete links plus a QR code for opening the page on a phone.

mod atomic;
mod background;
mod config;
mod error;
mod extensions;
mod files;
mod frontend;
mod health;
mod http;
mod logging;
mod storage;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::{Args, SHUTDOWN_GRACE_SECS, Settings};
use crate::frontend::format_file_size;
use crate::http::{client_ip, local_ip};
use crate::storage::Storage;

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(args.log_file.as_deref())?;

    let storage = Arc::new(Storage::open(&args.upload_dir).await?);
    let settings = Arc::new(Settings::new(&args, storage.root_path().to_path_buf()));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("Local access: http://localhost:{}", args.port);
    info!("Network access: http://{}:{}", local_ip(), args.port);
    info!(
        upload_dir = %settings.upload_dir.display(),
        max_file_size = %format_file_size(settings.max_file_size),
        allowed_extensions = %settings.extensions.dotted().join(", "),
        "Starting HTTP server at {}",
        addr
    );

    spawn_background_tasks(storage.clone(), Duration::from_secs(args.temp_ttl_secs));
    let app = build_router(storage, settings);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

fn build_router(storage: Arc<Storage>, settings: Arc<Settings>) -> Router {
    Router::new()
        .route(
            "/",
            get(frontend::index)
                .post(upload::upload_files)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/download/{filename}", get(files::download_file))
        .route("/delete/{filename}", get(files::delete_file))
        .route("/health", get(health::health))
        .route("/static/{*path}", get(frontend::serve_asset))
        .fallback(frontend::not_found)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(storage))
        .layer(Extension(settings))
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
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body as AxumBody, to_bytes};
    use axum::http::{StatusCode, header};
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn make_router(max_file_size: u64) -> (tempfile::TempDir, Arc<Storage>, Router) {
        let temp = tempdir().expect("tempdir");
        let limit = max_file_size.to_string();
        let args = Args::try_parse_from(["quickdrop", "--max-file-size", limit.as_str()])
            .expect("parse args");
        let storage = Arc::new(
            Storage::open(temp.path().join("uploads"))
                .await
                .expect("open storage"),
        );
        let settings = Arc::new(Settings::new(&args, storage.root_path().to_path_buf()));
        let router = build_router(storage.clone(), settings);
        (temp, storage, router)
    }

    fn upload_request(filename: &str, data: &str) -> Request<AxumBody> {
        let body = format!(
            "--X\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\r\n{data}\r\n--X--\r\n"
        );
        Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=X")
            .header(header::CONTENT_LENGTH, body.len())
            .body(AxumBody::from(body))
            .expect("request")
    }

    #[tokio::test]
    async fn upload_list_download_delete_round() {
        let (_temp, storage, router) = make_router(1024).await;

        let response = router
            .clone()
            .oneshot(upload_request("hello world.txt", "hi there"))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");

        let response = router
            .clone()
            .oneshot(Request::get("/").body(AxumBody::empty()).expect("request"))
            .await
            .expect("index");
        let html = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert!(String::from_utf8_lossy(&html).contains("/download/hello%20world.txt"));

        let response = router
            .clone()
            .oneshot(
                Request::get("/download/hello%20world.txt")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"hi there");

        let response = router
            .clone()
            .oneshot(
                Request::get("/delete/hello%20world.txt")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("delete");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(!storage.root_path().join("hello world.txt").exists());
    }

    #[tokio::test]
    async fn oversize_upload_is_413() {
        let (_temp, storage, router) = make_router(16).await;
        let response = router
            .oneshot(upload_request("big.txt", &"x".repeat(64)))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            std::fs::read_dir(storage.root_path()).expect("read dir").count(),
            0
        );
    }

    #[tokio::test]
    async fn encoded_traversal_is_forbidden() {
        let (_temp, _storage, router) = make_router(1024).await;
        let response = router
            .oneshot(
                Request::get("/download/..%2F..%2Fetc%2Fpasswd")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("download");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let (_temp, _storage, router) = make_router(1024).await;
        let response = router
            .clone()
            .oneshot(Request::get("/health").body(AxumBody::empty()).expect("request"))
            .await
            .expect("health");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/nope").body(AxumBody::empty()).expect("request"))
            .await
            .expect("fallback");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
