#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! An authenticated HTTP client for one upstream InfluxDB v2-compatible node.
//!
//! The client covers the three surfaces the proxy core needs from an
//! upstream: the compressed line-protocol write (`/api/v2/write`), the
//! liveness ping (`/ping`), and the two query endpoints (flux at
//! `/api/v2/query`, InfluxQL at `/query`). Write responses are classified
//! into the retry taxonomy the caller's failover logic keys off.

use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE},
    StatusCode,
};
use snafu::prelude::*;
use std::{io::Read, time::Duration};
use tracing::{debug, warn};

pub use reqwest::Method;

/// Classified outcome of a write to the upstream.
///
/// The variants mirror the upstream's documented status codes. Callers
/// branch on [`WriteError::is_terminal()`] (drop the payload) versus
/// everything else (spool and retry).
#[derive(Debug, Snafu)]
pub enum WriteError {
    /// 400: the payload is malformed and will never be accepted.
    #[snafu(display("bad request"))]
    BadRequest,

    /// 401: the configured token was rejected.
    #[snafu(display("unauthorized"))]
    Unauthorized,

    /// 404: the org/bucket does not exist on this upstream.
    #[snafu(display("not found"))]
    NotFound,

    /// 500: the upstream failed internally.
    #[snafu(display("internal error"))]
    Internal,

    /// 503: the upstream is overloaded or restarting.
    #[snafu(display("unavailable error"))]
    Unavailable,

    /// Any other status, e.g. a proxy in between answering 413.
    #[snafu(display("unknown error (status {status})"))]
    Unknown {
        /// The unexpected status code.
        status: StatusCode,
    },

    /// The request never produced a response (connect/timeout/reset).
    #[snafu(display("transport error: {source}"))]
    Transport {
        /// The underlying transport failure.
        source: reqwest::Error,
    },
}

impl WriteError {
    /// Terminal rejections: retrying or spooling cannot succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::BadRequest | Self::NotFound)
    }

    /// True when the failure indicates the node itself is unreachable, as
    /// opposed to it rejecting this particular request.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Errors performing a query round-trip.
#[derive(Debug, Snafu)]
pub enum QueryError {
    /// The request could not be sent or the response body not read.
    #[snafu(display("query transport error: {source}"))]
    QueryTransport {
        /// The underlying transport failure.
        source: reqwest::Error,
    },

    /// The upstream answered with an error status.
    #[snafu(display("upstream returned {status}: {text}"))]
    UpstreamStatus {
        /// The error status code.
        status: StatusCode,
        /// The upstream's error body, decoded as text.
        text: String,
    },

    /// A gzip-encoded response body failed to decode.
    #[snafu(display("error decoding gzip body: {source}"))]
    DecodeGzip {
        /// The decoder failure.
        source: std::io::Error,
    },
}

/// Errors constructing a [`Client`].
#[derive(Debug, Snafu)]
pub enum BuildError {
    /// The underlying connection pool could not be configured.
    #[snafu(display("unable to build http client: {source}"))]
    Reqwest {
        /// The builder failure.
        source: reqwest::Error,
    },
}

/// A complete response captured for forwarding or reduction.
#[derive(Debug)]
pub struct QueryResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response headers, verbatim.
    pub headers: HeaderMap,
    /// Response body. Decompressed when requested, verbatim otherwise.
    pub body: Bytes,
}

/// Connection tuning shared by every client in a proxy process.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Per-request bound covering connect, send and response.
    pub write_timeout: Duration,
    /// Skip TLS certificate verification for https upstreams.
    pub tls_skip_verify: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            tls_skip_verify: false,
        }
    }
}

/// Idle connections kept around per upstream host.
const MAX_IDLE_PER_HOST: usize = 100;

/// A client to one upstream node.
#[derive(Debug)]
pub struct Client {
    /// Upstream base URL without a trailing slash.
    url: String,
    /// The `Authorization` header value, `Token <token>`.
    auth: String,
    client: reqwest::Client,
}

impl Client {
    /// Build a client for the node at `url`, authenticating with `token`.
    pub fn new(url: impl Into<String>, token: &str, opts: ConnectionOptions) -> Result<Self, BuildError> {
        let mut url = url.into();
        while url.ends_with('/') {
            url.pop();
        }

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(30))
            .timeout(opts.write_timeout)
            .danger_accept_invalid_certs(opts.tls_skip_verify)
            .build()
            .context(ReqwestSnafu)?;

        Ok(Self {
            url,
            auth: format!("Token {token}"),
            client,
        })
    }

    /// The upstream base URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Liveness probe: GET `/ping`, healthy iff the upstream answers 204.
    pub async fn ping(&self) -> bool {
        let resp = self
            .client
            .get(format!("{}/ping", self.url))
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status() == StatusCode::NO_CONTENT => true,
            Ok(resp) => {
                debug!(status = %resp.status(), url = %self.url, "ping rejected");
                false
            }
            Err(error) => {
                debug!(%error, url = %self.url, "ping failed");
                false
            }
        }
    }

    /// POST one gzip-compressed line-protocol batch to
    /// `/api/v2/write?org=..&bucket=..`.
    pub async fn write_compressed(
        &self,
        org: &str,
        bucket: &str,
        body: Bytes,
    ) -> Result<(), WriteError> {
        let resp = self
            .client
            .post(format!("{}/api/v2/write", self.url))
            .query(&[("org", org), ("bucket", bucket)])
            .header(AUTHORIZATION, &self.auth)
            .header(CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await
            .context(TransportSnafu)?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let text = resp.text().await.unwrap_or_default();
        warn!(%status, url = %self.url, response = %text, "upstream rejected write");

        Err(match status.as_u16() {
            400 => WriteError::BadRequest,
            401 => WriteError::Unauthorized,
            404 => WriteError::NotFound,
            500 => WriteError::Internal,
            503 => WriteError::Unavailable,
            _ => WriteError::Unknown { status },
        })
    }

    /// POST a flux query to `/api/v2/query?org=..`, returning the response
    /// verbatim for forwarding to the caller.
    pub async fn query_flux(
        &self,
        org: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<QueryResponse, QueryError> {
        let resp = self
            .client
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", org)])
            .header(AUTHORIZATION, &self.auth)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .context(QueryTransportSnafu)?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.context(QueryTransportSnafu)?;

        Ok(QueryResponse {
            status,
            headers,
            body,
        })
    }

    /// Issue an InfluxQL query against the legacy `/query` endpoint.
    ///
    /// `query_string` is the pre-encoded parameter string (q, db, rp, ...).
    /// With `decompress` set, a gzip response body is decoded before being
    /// returned - the shape the parallel reducer consumes. Error statuses
    /// are folded into [`QueryError::UpstreamStatus`].
    ///
    /// `quiet` drops per-request error logging to debug; the parallel
    /// dispatcher sets it so one slow or dead sibling does not spam the log
    /// for every fanned-out query.
    pub async fn query_v1(
        &self,
        method: Method,
        query_string: &str,
        decompress: bool,
        quiet: bool,
    ) -> Result<QueryResponse, QueryError> {
        let result = self.query_v1_inner(method, query_string, decompress).await;

        if let Err(error) = &result {
            if quiet {
                debug!(%error, url = %self.url, "parallel query branch failed");
            } else {
                warn!(%error, url = %self.url, "query failed");
            }
        }

        result
    }

    async fn query_v1_inner(
        &self,
        method: Method,
        query_string: &str,
        decompress: bool,
    ) -> Result<QueryResponse, QueryError> {
        let resp = self
            .client
            .request(method, format!("{}/query?{}", self.url, query_string))
            .header(AUTHORIZATION, &self.auth)
            .send()
            .await
            .context(QueryTransportSnafu)?;

        let status = resp.status();
        let mut headers = resp.headers().clone();

        let gzipped = headers
            .get(CONTENT_ENCODING)
            .map(|v| v.as_bytes() == b"gzip")
            .unwrap_or(false);

        let mut body = resp.bytes().await.context(QueryTransportSnafu)?;
        if decompress && gzipped {
            let mut decoded = Vec::new();
            GzDecoder::new(&body[..])
                .read_to_end(&mut decoded)
                .context(DecodeGzipSnafu)?;
            body = decoded.into();
            headers.remove(CONTENT_ENCODING);
            headers.remove(reqwest::header::CONTENT_LENGTH);
        }

        if status.as_u16() >= 400 {
            return UpstreamStatusSnafu {
                status,
                text: String::from_utf8_lossy(&body).into_owned(),
            }
            .fail();
        }

        Ok(QueryResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn client_for(server: &mockito::Server) -> Client {
        Client::new(server.url(), "tok", ConnectionOptions::default()).unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn write_success_sends_auth_and_encoding() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::UrlEncoded("org".into(), "o".into()))
            .match_header("authorization", "Token tok")
            .match_header("content-encoding", "gzip")
            .with_status(204)
            .create_async()
            .await;

        let client = client_for(&server);
        client
            .write_compressed("o", "b", Bytes::from(gzip(b"cpu v=1 1\n")))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn write_statuses_are_classified() {
        let cases = [
            (400, "bad request"),
            (401, "unauthorized"),
            (404, "not found"),
            (500, "internal error"),
            (503, "unavailable error"),
        ];

        for (status, display) in cases {
            let mut server = mockito::Server::new_async().await;
            let _m = server
                .mock("POST", "/api/v2/write")
                .match_query(mockito::Matcher::Any)
                .with_status(status)
                .create_async()
                .await;

            let err = client_for(&server)
                .write_compressed("o", "b", Bytes::from_static(b""))
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), display, "status {status}");
        }
    }

    #[tokio::test]
    async fn write_unexpected_status_is_unknown() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::Any)
            .with_status(413)
            .create_async()
            .await;

        let err = client_for(&server)
            .write_compressed("o", "b", Bytes::from_static(b""))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Unknown { status } if status.as_u16() == 413));
        assert!(!err.is_terminal());
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn write_connection_refused_is_transport() {
        // Nothing listens on this port.
        let client = Client::new(
            "http://127.0.0.1:1",
            "tok",
            ConnectionOptions {
                write_timeout: Duration::from_millis(500),
                tls_skip_verify: false,
            },
        )
        .unwrap();

        let err = client
            .write_compressed("o", "b", Bytes::from_static(b""))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn terminal_classification() {
        assert!(WriteError::BadRequest.is_terminal());
        assert!(WriteError::NotFound.is_terminal());
        assert!(!WriteError::Internal.is_terminal());
        assert!(!WriteError::Unavailable.is_terminal());
        assert!(!WriteError::Unauthorized.is_terminal());
    }

    #[tokio::test]
    async fn ping_healthy_only_on_204() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .with_status(204)
            .create_async()
            .await;

        assert!(client_for(&server).ping().await);
        mock.assert_async().await;

        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/ping")
            .with_status(200)
            .create_async()
            .await;
        assert!(!client_for(&server).ping().await);
    }

    #[tokio::test]
    async fn query_v1_collects_body() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/query")
            .match_query(mockito::Matcher::UrlEncoded(
                "q".into(),
                "SHOW MEASUREMENTS".into(),
            ))
            .match_header("authorization", "Token tok")
            .with_status(200)
            .with_body(r#"{"results":[]}"#)
            .create_async()
            .await;

        let resp = client_for(&server)
            .query_v1(Method::GET, "q=SHOW%20MEASUREMENTS", true, false)
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], br#"{"results":[]}"#);
    }

    #[tokio::test]
    async fn query_v1_decodes_gzip_bodies() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/query")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-encoding", "gzip")
            .with_body(gzip(br#"{"results":[{"statement_id":0}]}"#))
            .create_async()
            .await;

        let resp = client_for(&server)
            .query_v1(Method::GET, "q=x", true, false)
            .await
            .unwrap();

        assert_eq!(&resp.body[..], br#"{"results":[{"statement_id":0}]}"#);
        assert!(resp.headers.get(CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn query_v1_error_status_surfaces_message() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/query")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":"invalid ql"}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .query_v1(Method::GET, "q=x", true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::UpstreamStatus { status, .. } if status.as_u16() == 400));
    }

    #[tokio::test]
    async fn flux_query_passthrough() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/v2/query")
            .match_query(mockito::Matcher::UrlEncoded("org".into(), "o".into()))
            .match_header("content-type", "application/vnd.flux")
            .with_status(200)
            .with_header("content-type", "text/csv")
            .with_body("_result,0\n")
            .create_async()
            .await;

        let resp = client_for(&server)
            .query_flux("o", "application/vnd.flux", Bytes::from_static(b"from(bucket:\"b\")"))
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], b"_result,0\n");
        assert_eq!(
            resp.headers.get(CONTENT_TYPE).unwrap().to_str().unwrap(),
            "text/csv"
        );
    }
}
