//! HTTP delivery of replay segments.
//!
//! [`HttpTransport`] posts each segment's payload to a fixed endpoint and
//! carries the segment metadata in `x-replay-*` headers. Status codes map
//! onto [`TransportError`] so the engine can tell a transient failure from
//! a refused replay.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use replay_core::{PayloadEncoding, SegmentUpload, Transport, TransportError};
use reqwest::Url;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use thiserror::Error;

/// Default request timeout for uploads.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const REPLAY_ID_HEADER: &str = "x-replay-id";
pub const SEGMENT_ID_HEADER: &str = "x-replay-segment-id";
pub const REPLAY_TYPE_HEADER: &str = "x-replay-type";
pub const ERROR_IDS_HEADER: &str = "x-replay-error-ids";
pub const TRACE_IDS_HEADER: &str = "x-replay-trace-ids";
pub const START_TIMESTAMP_HEADER: &str = "x-replay-start-timestamp";

/// Transport construction errors.
#[derive(Debug, Error)]
pub enum HttpTransportError {
    /// The endpoint is not an absolute http(s) URL.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Posts segments to an HTTP endpoint.
///
/// # Thread Safety
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: Url,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Creates a transport posting to `endpoint`.
    pub fn new(endpoint: &str) -> Result<Self, HttpTransportError> {
        let url = Url::parse(endpoint).map_err(|e| HttpTransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HttpTransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(HttpTransportError::ClientBuild)?;

        Ok(Self {
            http,
            endpoint: url,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, upload: SegmentUpload) -> Result<(), TransportError> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json");
        if upload.payload.encoding == PayloadEncoding::Gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        for (name, value) in segment_headers(&upload) {
            request = request.header(name, value);
        }

        let response = request
            .body(upload.payload.bytes)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        tracing::debug!(
            replay_id = %upload.replay_id,
            segment_id = upload.segment_id,
            status,
            "segment upload answered"
        );
        classify_status(status)
    }
}

/// Metadata headers for a segment.
pub fn segment_headers(upload: &SegmentUpload) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        (REPLAY_ID_HEADER, upload.replay_id.to_string()),
        (SEGMENT_ID_HEADER, upload.segment_id.to_string()),
        (REPLAY_TYPE_HEADER, upload.mode.to_string()),
    ];
    if !upload.error_ids.is_empty() {
        headers.push((ERROR_IDS_HEADER, upload.error_ids.join(",")));
    }
    if !upload.trace_ids.is_empty() {
        headers.push((TRACE_IDS_HEADER, upload.trace_ids.join(",")));
    }
    if let Some(start) = upload.replay_start_timestamp {
        headers.push((START_TIMESTAMP_HEADER, start.timestamp_millis().to_string()));
    }
    headers
}

/// Maps an HTTP status onto the engine's delivery outcome.
pub const fn classify_status(status: u16) -> Result<(), TransportError> {
    if matches!(status, 200..=299) {
        Ok(())
    } else {
        Err(TransportError::Rejected { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};
    use replay_core::{RecordingMode, RecordingPayload, ReplayId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn upload(segment_id: u32, encoding: PayloadEncoding) -> SegmentUpload {
        SegmentUpload {
            replay_id: ReplayId::new("3f2a9c").unwrap(),
            segment_id,
            mode: RecordingMode::Buffer,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 5).unwrap(),
            replay_start_timestamp: (segment_id == 0)
                .then(|| Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            error_ids: vec!["e1".to_string(), "e2".to_string()],
            trace_ids: Vec::new(),
            urls: Vec::new(),
            payload: RecordingPayload {
                bytes: b"[]".to_vec(),
                encoding,
                event_count: 0,
            },
        }
    }

    /// Accepts one request, answers with `status` and returns the raw request.
    async fn serve_once(listener: TcpListener, status: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let read = socket.read(&mut chunk).await.unwrap();
            raw.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&raw).to_lowercase();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    break;
                }
            }
            if read == 0 {
                break;
            }
        }
        let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        socket.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&raw).to_lowercase()
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(matches!(
            HttpTransport::new("ftp://example.com/replay"),
            Err(HttpTransportError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            HttpTransport::new("not a url"),
            Err(HttpTransportError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn debug_shows_endpoint() {
        let transport = HttpTransport::new("https://ingest.example.com/replay").unwrap();
        let debug = format!("{transport:?}");
        assert!(debug.contains("ingest.example.com"));
        assert_eq!(transport.endpoint(), "https://ingest.example.com/replay");
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(classify_status(200), Ok(()));
        assert_eq!(classify_status(204), Ok(()));
        assert_eq!(
            classify_status(413),
            Err(TransportError::Rejected { status: 413 })
        );
        assert!(classify_status(429).unwrap_err().is_retryable());
        assert!(!classify_status(400).unwrap_err().is_retryable());
    }

    #[test]
    fn headers_carry_segment_metadata() {
        let headers = segment_headers(&upload(0, PayloadEncoding::Json));
        assert_eq!(
            headers,
            vec![
                (REPLAY_ID_HEADER, "3f2a9c".to_string()),
                (SEGMENT_ID_HEADER, "0".to_string()),
                (REPLAY_TYPE_HEADER, "buffer".to_string()),
                (ERROR_IDS_HEADER, "e1,e2".to_string()),
                (START_TIMESTAMP_HEADER, "1735689600000".to_string()),
            ]
        );

        let later = segment_headers(&upload(3, PayloadEncoding::Json));
        assert!(later.iter().all(|(name, _)| *name != START_TIMESTAMP_HEADER));
    }

    #[tokio::test]
    async fn posts_payload_with_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "200 OK"));

        let transport = HttpTransport::new(&format!("http://{addr}/replay")).unwrap();
        let result = transport.send(upload(0, PayloadEncoding::Gzip)).await;
        assert_eq!(result, Ok(()));

        let request = server.await.unwrap();
        assert!(request.starts_with("post /replay http/1.1"));
        assert!(request.contains("content-encoding: gzip"));
        assert!(request.contains("x-replay-segment-id: 0"));
        assert!(request.contains("x-replay-error-ids: e1,e2"));
        assert!(request.ends_with("[]"));
    }

    #[tokio::test]
    async fn server_errors_are_rejections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "503 Service Unavailable"));

        let transport = HttpTransport::new(&format!("http://{addr}/replay")).unwrap();
        let result = transport.send(upload(1, PayloadEncoding::Json)).await;
        assert_eq!(result, Err(TransportError::Rejected { status: 503 }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(&format!("http://{addr}/replay")).unwrap();
        let result = transport.send(upload(1, PayloadEncoding::Json)).await;
        assert!(matches!(result, Err(TransportError::Network(_))));
    }
}
