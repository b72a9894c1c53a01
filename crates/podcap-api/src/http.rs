use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use tokio::{fs::File, net::TcpListener};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info};

use crate::{error::ApiError, handler::ApiHandler};

const PCAP_CONTENT_TYPE: &str = "application/vnd.tcpdump.pcap";

/// HTTP API service builder.
pub struct HttpApi<H> {
    handler: Arc<H>,
}

impl<H> HttpApi<H>
where
    H: ApiHandler,
{
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Build axum router with mounted endpoints.
    ///
    /// Routes:
    /// - GET /captures/{file} - Download a capture file
    /// - GET /healthz - Liveness
    /// - GET /metrics - Prometheus exposition
    /// - GET /api/v1/captures - List live captures
    pub fn router(self) -> Router {
        Router::new()
            .route("/captures/{file}", get(download::<H>))
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics::<H>))
            .route("/api/v1/captures", get(list_captures::<H>))
            .with_state(self.handler)
    }
}

/// Serve `router` on `addr` until `cancel` fires, then drain in-flight requests.
pub async fn serve(addr: SocketAddr, router: Router, cancel: CancellationToken) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(target: "podcap.api", addr = %listener.local_addr()?, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!(target: "podcap.api", "http server stopped");
    Ok(())
}

/// GET /captures/{file}
async fn download<H>(
    State(handler): State<Arc<H>>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    if file.is_empty() || file.contains(['/', '\\']) || file.contains("..") {
        return Err(ApiError::InvalidRequest(format!("bad file name: {file}")));
    }

    let path = handler.capture_dir().join(&file);
    let opened = match File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ApiError::NotFound(file)),
        Err(e) => return Err(ApiError::Internal(format!("open {}: {e}", path.display()))),
    };
    let meta = opened
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(format!("stat {}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(ApiError::NotFound(file));
    }
    debug!(target: "podcap.api", file = %path.display(), size = meta.len(), "streaming capture");

    // tcpdump may still be appending, so the length is not advertised.
    Ok((
        [
            (header::CONTENT_TYPE, PCAP_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(opened)),
    ))
}

/// GET /healthz
async fn healthz() -> &'static str {
    "ok"
}

/// GET /metrics
async fn metrics<H>(State(handler): State<Arc<H>>) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let text = handler.metrics_text()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text))
}

/// GET /api/v1/captures
async fn list_captures<H>(State(handler): State<Arc<H>>) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    Ok(Json(handler.captures().await?))
}

#[cfg(test)]
mod tests {
    use std::path::{Path as FsPath, PathBuf};

    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::CaptureInfo;

    struct Fixed {
        dir: PathBuf,
    }

    #[async_trait]
    impl ApiHandler for Fixed {
        async fn captures(&self) -> Result<Vec<CaptureInfo>, ApiError> {
            Ok(vec![CaptureInfo {
                pod: "default/web-0".into(),
                job: "default/web".into(),
                file_location: self.dir.join("capture-web-web-0.pcap").display().to_string(),
                pid: 42,
                timeout_ms: None,
            }])
        }

        fn metrics_text(&self) -> Result<String, ApiError> {
            Ok("podcap_active_captures 1\n".into())
        }

        fn capture_dir(&self) -> &FsPath {
            &self.dir
        }
    }

    fn router(dir: &FsPath) -> Router {
        HttpApi::new(Arc::new(Fixed {
            dir: dir.to_path_buf(),
        }))
        .router()
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let resp = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn serves_capture_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("capture-web-web-0.pcap0"), b"pcapdata").unwrap();

        let resp = router(dir.path())
            .oneshot(
                Request::get("/captures/capture-web-web-0.pcap0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], PCAP_CONTENT_TYPE);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"pcapdata");

        let (status, _) = get(router(dir.path()), "/captures/missing.pcap").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn streams_large_captures_intact() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("big.pcap0"), &data).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let resp = router(dir.path())
            .oneshot(Request::get("/captures/big.pcap0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), data.len());
        assert!(body[..] == data[..]);

        let (status, _) = get(router(dir.path()), "/captures/nested").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        for uri in ["/captures/..", "/captures/..%2Fetc%2Fpasswd", "/captures/a%5Cb"] {
            let (status, _) = get(router(dir.path()), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn health_metrics_and_listing() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(get(router(dir.path()), "/healthz").await, (StatusCode::OK, "ok".into()));

        let (status, body) = get(router(dir.path()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("podcap_active_captures 1"));

        let (status, body) = get(router(dir.path()), "/api/v1/captures").await;
        assert_eq!(status, StatusCode::OK);
        let listed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listed[0]["pod"], "default/web-0");
        assert_eq!(listed[0]["pid"], 42);
        assert!(listed[0]["fileLocation"].as_str().unwrap().ends_with("capture-web-web-0.pcap"));
        assert!(listed[0].get("timeoutMs").is_none());
    }

    #[tokio::test]
    async fn serve_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let server = tokio::spawn(serve(
            "127.0.0.1:0".parse().unwrap(),
            router(dir.path()),
            cancel.clone(),
        ));
        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
