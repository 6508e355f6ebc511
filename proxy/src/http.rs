//! HTTP front door for the proxy.
//!
//! [`HttpDelegate::route()`] maps requests onto the write and query
//! pipelines; the server glue (binding, shutdown) lives with the binary.
//! Errors carry their user-facing status code via
//! [`Error::as_status_code()`], and render as the InfluxDB-style JSON error
//! envelope through [`error_response()`].

use crate::{
    config::ProxyConfig,
    dispatch::DispatchError,
    ql,
    reducer::{self, Response as QlResponse},
    scan::Precision,
    proxy::get_key,
    Proxy,
};
use backend_client::QueryResponse;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use hyper::{
    header::{HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE},
    Body, Method, Request, Response, StatusCode,
};
use serde::Deserialize;
use std::{io::Read, sync::Arc};
use thiserror::Error;
use tracing::debug;

/// Largest accepted (decompressed) request body.
const MAX_REQUEST_BYTES: usize = 32 * 1024 * 1024;

/// Advertised in the `X-Influxdb-Version` header.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors returned by the HTTP request handler.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested path has no registered handler.
    #[error("not found")]
    NoHandler,

    /// The path exists but not for this method.
    #[error("method not allow")]
    MethodNotAllowed,

    /// Front-door auth is configured and the request failed it.
    #[error("authentication failed")]
    Unauthenticated,

    /// The `Content-Encoding` header is invalid and cannot be read.
    #[error("invalid content-encoding header: {0}")]
    NonUtf8ContentHeader(hyper::header::ToStrError),

    /// The specified `Content-Encoding` is not acceptable.
    #[error("unacceptable content-encoding: {0}")]
    InvalidContentEncoding(String),

    /// The client disconnected mid-body.
    #[error("client disconnected")]
    ClientHangup(hyper::Error),

    /// The client sent a request body exceeding the configured maximum.
    #[error("max request size ({0} bytes) exceeded")]
    RequestSizeExceeded(usize),

    /// Decoding a gzip-compressed body failed.
    #[error("error decoding gzip stream: {0}")]
    InvalidGzip(std::io::Error),

    /// The query string / form parameters failed to decode.
    #[error("failed to decode request parameters: {0}")]
    DecodeParams(#[from] serde_urlencoded::de::Error),

    /// A v2 request without an org.
    #[error("org not found")]
    MissingOrg,

    /// A v2 write without a bucket.
    #[error("bucket not found")]
    MissingBucket,

    /// A v1 write without a db.
    #[error("db not found")]
    MissingDb,

    /// A v1 query that names no database at all.
    #[error("database not found")]
    DatabaseNotFound,

    /// A db/rp coordinate with no alias entry.
    #[error("db/rp not mapping")]
    DbrpNotMapping,

    /// An empty query text.
    #[error("empty query")]
    EmptyQuery,

    /// A statement shape the dispatcher does not understand.
    #[error("illegal query")]
    IllegalQuery,

    /// A flux script without a recognizable source bucket.
    #[error("can't get bucket")]
    GetBucket,

    /// A flux script without a recognizable measurement filter.
    #[error("can't get measurement")]
    GetMeasurement,

    /// A v2 query body that is neither raw flux nor the JSON envelope.
    #[error("failed parsing request body as JSON; if sending a raw Flux script, set 'Content-Type: application/vnd.flux' in your request headers: {0}")]
    InvalidFluxBody(serde_json::Error),

    /// `/replica` called without the full key coordinate.
    #[error("invalid org, bucket or meas")]
    InvalidReplicaParams,

    /// The dispatcher could not serve the query.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl Error {
    /// The status code this error is reported with.
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            Self::NoHandler => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::InvalidContentEncoding(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::RequestSizeExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NonUtf8ContentHeader(_)
            | Self::ClientHangup(_)
            | Self::InvalidGzip(_)
            | Self::DecodeParams(_)
            | Self::MissingOrg
            | Self::MissingBucket
            | Self::MissingDb
            | Self::DatabaseNotFound
            | Self::DbrpNotMapping
            | Self::EmptyQuery
            | Self::IllegalQuery
            | Self::GetBucket
            | Self::GetMeasurement
            | Self::InvalidFluxBody(_)
            | Self::InvalidReplicaParams => StatusCode::BAD_REQUEST,
            // The at-least-once write contract never surfaces upstream
            // failures; queries report them as a client-visible 400.
            Self::Dispatch(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Render `error` as the InfluxDB-style JSON error envelope.
pub fn error_response(error: &Error) -> Response<Body> {
    let msg = error.to_string();
    let body =
        serde_json::to_vec(&QlResponse::from_error(msg.as_str())).expect("error envelope serializes");

    let header_msg = HeaderValue::from_str(&msg)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid error text"));

    Response::builder()
        .status(error.as_status_code())
        .header(CONTENT_TYPE, "application/json")
        .header("X-Influxdb-Error", header_msg)
        .header("X-Influxdb-Version", VERSION)
        .body(Body::from(body))
        .expect("valid error response")
}

#[derive(Debug, Deserialize)]
struct WriteParamsV2 {
    #[serde(default)]
    org: String,
    #[serde(default)]
    bucket: String,
    #[serde(default)]
    precision: Precision,
}

#[derive(Debug, Deserialize)]
struct WriteParamsV1 {
    #[serde(default)]
    db: String,
    #[serde(default)]
    rp: String,
    #[serde(default)]
    precision: Precision,
}

#[derive(Debug, Deserialize)]
struct QueryParamsV2 {
    #[serde(default)]
    org: String,
}

#[derive(Debug, Deserialize)]
struct ReplicaParams {
    #[serde(default)]
    org: String,
    #[serde(default)]
    bucket: String,
    #[serde(default)]
    meas: String,
}

/// Services requests to the proxy's HTTP endpoint.
#[derive(Debug)]
pub struct HttpDelegate {
    proxy: Arc<Proxy>,
    token: Option<String>,
    max_request_bytes: usize,
    write_tracing: bool,
    query_tracing: bool,
}

impl HttpDelegate {
    /// Wrap `proxy` with the front-door policy from `cfg`.
    pub fn new(proxy: Arc<Proxy>, cfg: &ProxyConfig) -> Self {
        Self {
            proxy,
            token: (!cfg.token.is_empty()).then(|| cfg.token.clone()),
            max_request_bytes: MAX_REQUEST_BYTES,
            write_tracing: cfg.write_tracing,
            query_tracing: cfg.query_tracing,
        }
    }

    /// Route `req` to the appropriate handler, if any.
    pub async fn route(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        match (req.method(), req.uri().path()) {
            (&Method::GET | &Method::POST, "/ping") => {
                Ok(respond(StatusCode::NO_CONTENT, Body::empty()))
            }
            (&Method::POST, "/api/v2/write") => {
                self.check_auth(&req)?;
                self.write_v2(req).await
            }
            (&Method::POST, "/write") => {
                self.check_auth(&req)?;
                self.write_v1(req).await
            }
            (&Method::POST, "/api/v2/query") => {
                self.check_auth(&req)?;
                self.query_flux(req).await
            }
            (&Method::GET | &Method::POST, "/query") => {
                self.check_auth(&req)?;
                self.query_v1(req).await
            }
            (&Method::GET, "/health") => {
                self.check_auth(&req)?;
                self.health().await
            }
            (&Method::GET, "/replica") => {
                self.check_auth(&req)?;
                self.replica(&req)
            }
            (
                _,
                "/ping" | "/api/v2/write" | "/write" | "/api/v2/query" | "/query" | "/health"
                | "/replica",
            ) => Err(Error::MethodNotAllowed),
            _ => Err(Error::NoHandler),
        }
    }

    fn check_auth(&self, req: &Request<Body>) -> Result<(), Error> {
        let want = match &self.token {
            Some(want) => want,
            None => return Ok(()),
        };

        let got = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Token "))
            .map(str::trim)
            .unwrap_or("");

        if got == want {
            Ok(())
        } else {
            Err(Error::Unauthenticated)
        }
    }

    async fn write_v2(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let params: WriteParamsV2 = serde_urlencoded::from_str(req.uri().query().unwrap_or(""))?;
        if params.org.is_empty() {
            return Err(Error::MissingOrg);
        }
        if params.bucket.is_empty() {
            return Err(Error::MissingBucket);
        }

        let body = self.read_body(req).await?;
        self.proxy
            .write(&body, &params.org, &params.bucket, params.precision)
            .await;

        if self.write_tracing {
            debug!(
                org = %params.org,
                bucket = %params.bucket,
                precision = %params.precision,
                bytes = body.len(),
                "accepted write"
            );
        }
        Ok(respond(StatusCode::NO_CONTENT, Body::empty()))
    }

    async fn write_v1(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let params: WriteParamsV1 = serde_urlencoded::from_str(req.uri().query().unwrap_or(""))?;
        if params.db.is_empty() {
            return Err(Error::MissingDb);
        }
        let (org, bucket) = self
            .proxy
            .resolve_dbrp(&params.db, &params.rp)
            .ok_or(Error::DbrpNotMapping)?;

        let body = self.read_body(req).await?;
        self.proxy
            .write(&body, &org, &bucket, params.precision)
            .await;

        if self.write_tracing {
            debug!(
                db = %params.db,
                rp = %params.rp,
                org = %org,
                bucket = %bucket,
                bytes = body.len(),
                "accepted v1 write"
            );
        }
        Ok(respond(StatusCode::NO_CONTENT, Body::empty()))
    }

    async fn query_flux(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let params: QueryParamsV2 = serde_urlencoded::from_str(req.uri().query().unwrap_or(""))?;
        if params.org.is_empty() {
            return Err(Error::MissingOrg);
        }

        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_owned();

        let body = self.read_body(req).await?;
        let query_text = if content_type == "application/vnd.flux" {
            String::from_utf8_lossy(&body).into_owned()
        } else {
            #[derive(Deserialize)]
            struct FluxBody {
                #[serde(default)]
                query: String,
            }
            serde_json::from_slice::<FluxBody>(&body)
                .map_err(Error::InvalidFluxBody)?
                .query
        };

        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let (bucket, measurement) = ql::scan_flux(query_text);
        let bucket = bucket.ok_or(Error::GetBucket)?;
        let measurement = measurement.ok_or(Error::GetMeasurement)?;

        let key = get_key(&params.org, &bucket, &measurement);
        if self.query_tracing {
            debug!(org = %params.org, %bucket, %measurement, "dispatching flux query");
        }

        let org = params.org;
        let resp = self
            .proxy
            .query_single(&key, move |backend| {
                let org = org.clone();
                let content_type = content_type.clone();
                let body = body.clone();
                async move {
                    backend
                        .client()
                        .query_flux(&org, &content_type, body)
                        .await
                }
            })
            .await?;

        Ok(forward_response(resp))
    }

    async fn query_v1(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let accept_gzip = req
            .headers()
            .get(ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);
        let method = upstream_method(req.method());
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);

        let url_params: Vec<(String, String)> =
            serde_urlencoded::from_str(req.uri().query().unwrap_or(""))?;

        // A urlencoded POST form carries parameters too; they take
        // precedence over the query string.
        let mut params: Vec<(String, String)> = Vec::new();
        if is_form {
            let body = self.read_body(req).await?;
            params = serde_urlencoded::from_bytes(&body)?;
        }
        params.extend(url_params);

        let q = param(&params, "q").unwrap_or("").trim().to_owned();
        if q.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let tokens = ql::tokenize(&q);
        if !ql::is_valid(&tokens) {
            return Err(Error::IllegalQuery);
        }

        if self.query_tracing {
            debug!(%q, "dispatching v1 query");
        }

        // Never forward client credentials upstream.
        params.retain(|(k, _)| k != "u" && k != "p");

        let pretty = param(&params, "pretty") == Some("true");
        let first = tokens[0].to_ascii_lowercase();
        let stmt2 = ql::head_stmt(&tokens, 2);
        let stmt3 = ql::head_stmt(&tokens, 3);

        if (first == "select" || first == "show") && ql::has_from(&tokens) {
            let key = self.routing_key_from(&tokens, &params)?;
            let query_string =
                serde_urlencoded::to_string(&params).expect("parameters serialize");

            let resp = self
                .proxy
                .query_single(&key, move |backend| {
                    let method = method.clone();
                    let query_string = query_string.clone();
                    async move {
                        backend
                            .client()
                            .query_v1(method, &query_string, false, false)
                            .await
                    }
                })
                .await?;
            return Ok(forward_response(resp));
        }

        if first == "select" || first == "show" {
            // Meta queries see every backend; the responses are merged.
            params.retain(|(k, _)| k != "chunked");
            let query_string =
                serde_urlencoded::to_string(&params).expect("parameters serialize");

            let bodies = self.proxy.query_broadcast(method, &query_string).await?;

            let reduced = if stmt2 == "show measurements" || stmt2 == "show databases" {
                reducer::reduce_by_values(&bodies).map_err(DispatchError::from)?
            } else if stmt3 == "show field keys"
                || stmt3 == "show tag keys"
                || stmt3 == "show tag values"
            {
                reducer::reduce_by_series(&bodies).map_err(DispatchError::from)?
            } else {
                QlResponse::from_series(Vec::new())
            };

            return Ok(ql_json_response(&reduced, pretty, accept_gzip));
        }

        if stmt2 == "delete from" || stmt2 == "drop measurement" {
            let key = self.routing_key_from(&tokens, &params)?;
            let query_string =
                serde_urlencoded::to_string(&params).expect("parameters serialize");

            let mut responses = self
                .proxy
                .query_key_backends(&key, method, &query_string)
                .await?;
            return Ok(forward_response(responses.remove(0)));
        }

        Err(Error::IllegalQuery)
    }

    /// Resolve a statement's routing key: measurement from the statement,
    /// db/rp from the parameters with the statement as fallback, org/bucket
    /// through the alias table.
    fn routing_key_from(
        &self,
        tokens: &[String],
        params: &[(String, String)],
    ) -> Result<String, Error> {
        let measurement = ql::measurement_from(tokens).ok_or(Error::GetMeasurement)?;

        let db = param(params, "db")
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .or_else(|| ql::database_from(tokens))
            .ok_or(Error::DatabaseNotFound)?;
        let rp = param(params, "rp")
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .or_else(|| ql::retention_policy_from(tokens))
            .unwrap_or_default();

        let (org, bucket) = self
            .proxy
            .resolve_dbrp(&db, &rp)
            .ok_or(Error::DbrpNotMapping)?;

        Ok(get_key(&org, &bucket, &measurement))
    }

    async fn health(&self) -> Result<Response<Body>, Error> {
        let health = self.proxy.health().await;
        let body = serde_json::to_vec(&health).expect("health snapshot serializes");
        Ok(json_response(StatusCode::OK, body))
    }

    fn replica(&self, req: &Request<Body>) -> Result<Response<Body>, Error> {
        let params: ReplicaParams = serde_urlencoded::from_str(req.uri().query().unwrap_or(""))?;
        if params.org.is_empty() || params.bucket.is_empty() || params.meas.is_empty() {
            return Err(Error::InvalidReplicaParams);
        }

        let key = get_key(&params.org, &params.bucket, &params.meas);
        let replicas = self
            .proxy
            .get_backends(&key)
            .iter()
            .zip(self.proxy.circles())
            .map(|(backend, circle)| {
                serde_json::json!({
                    "backend": {"name": backend.name(), "url": backend.url()},
                    "circle": {"id": circle.id(), "name": circle.name()},
                })
            })
            .collect::<Vec<_>>();

        let body = serde_json::to_vec(&replicas).expect("replica listing serializes");
        Ok(json_response(StatusCode::OK, body))
    }

    /// Read the request body, enforcing the size limit and decoding any
    /// content encoding.
    async fn read_body(&self, req: Request<Body>) -> Result<Bytes, Error> {
        let encoding = req
            .headers()
            .get(&CONTENT_ENCODING)
            .map(|v| v.to_str().map_err(Error::NonUtf8ContentHeader))
            .transpose()?;
        let ungzip = match encoding {
            None | Some("identity") => false,
            Some("gzip") => true,
            Some(v) => return Err(Error::InvalidContentEncoding(v.to_owned())),
        };

        let mut payload = req.into_body();
        let mut body = BytesMut::new();
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(Error::ClientHangup)?;
            // Limit the in-memory payload size.
            if (body.len() + chunk.len()) > self.max_request_bytes {
                return Err(Error::RequestSizeExceeded(self.max_request_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        let body = body.freeze();

        if !ungzip {
            return Ok(body);
        }

        // Read one byte beyond the limit so a decompression bomb shows up
        // as a too-long stream instead of an unbounded allocation.
        let decoder = flate2::read::GzDecoder::new(&body[..]);
        let mut decoder = decoder.take(self.max_request_bytes as u64 + 1);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).map_err(Error::InvalidGzip)?;
        if decoded.len() > self.max_request_bytes {
            return Err(Error::RequestSizeExceeded(self.max_request_bytes));
        }
        Ok(decoded.into())
    }
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn upstream_method(method: &Method) -> backend_client::Method {
    backend_client::Method::from_bytes(method.as_str().as_bytes()).expect("valid http method")
}

fn respond(status: StatusCode, body: Body) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("X-Influxdb-Version", VERSION)
        .body(body)
        .expect("valid response")
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header("X-Influxdb-Version", VERSION)
        .body(Body::from(body))
        .expect("valid response")
}

/// Forward an upstream response verbatim: status, headers and body.
fn forward_response(resp: QueryResponse) -> Response<Body> {
    let mut builder = Response::builder().status(resp.status.as_u16());
    for (name, value) in &resp.headers {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder = builder.header("X-Influxdb-Version", VERSION);
    builder
        .body(Body::from(resp.body))
        .expect("forwarded response is valid")
}

/// Serialize a reduced envelope, optionally pretty and gzip-encoded.
fn ql_json_response(reduced: &QlResponse, pretty: bool, accept_gzip: bool) -> Response<Body> {
    let json = if pretty {
        serde_json::to_vec_pretty(reduced)
    } else {
        serde_json::to_vec(reduced)
    }
    .expect("reduced envelope serializes");

    if !accept_gzip {
        return json_response(StatusCode::OK, json);
    }

    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut enc, &json).expect("write to a Vec cannot fail");
    let gzipped = enc.finish().expect("finish to a Vec cannot fail");

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .header(CONTENT_ENCODING, "gzip")
        .header("X-Influxdb-Version", VERSION)
        .body(Body::from(gzipped))
        .expect("valid response")
}
