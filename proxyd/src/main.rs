//! The proxy daemon: configuration, logging, the HTTP(S) server and graceful
//! shutdown around the [`proxy`] core.

use clap::Parser;
use hyper::{
    server::conn::Http,
    service::{make_service_fn, service_fn},
    Body, Request, Server,
};
use proxy::{
    config::ProxyConfig,
    http::{error_response, HttpDelegate},
    Proxy,
};
use std::{
    convert::Infallible,
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error>;

#[derive(Debug, Parser)]
#[command(
    name = "proxyd",
    version,
    about = "sharding and high-availability proxy for InfluxDB-compatible backends"
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "proxy.json")]
    config: PathBuf,

    /// Log filter directive, e.g. `info` or `proxy=debug,info`.
    #[arg(long, env = "PROXYD_LOG_FILTER", default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_filter))
        .init();

    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(error) => {
            error!(%error, config = %args.config.display(), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        circles = cfg.circles.len(),
        auth = !cfg.token.is_empty(),
        https = cfg.https_enabled,
        "configuration loaded"
    );
    for (id, circle) in cfg.circles.iter().enumerate() {
        info!(circle = id, backends = circle.backends.len(), name = %circle.name, "circle loaded");
    }

    let addr = match listen_addr(&cfg.listen_addr) {
        Ok(addr) => addr,
        Err(error) => {
            error!(%error, listen_addr = %cfg.listen_addr, "invalid listen address");
            return ExitCode::FAILURE;
        }
    };

    let proxy = match Proxy::new(&cfg).await {
        Ok(proxy) => Arc::new(proxy),
        Err(error) => {
            error!(%error, "failed to initialise proxy");
            return ExitCode::FAILURE;
        }
    };

    let delegate = Arc::new(HttpDelegate::new(Arc::clone(&proxy), &cfg));
    let served = if cfg.https_enabled {
        serve_https(addr, &cfg, Arc::clone(&delegate)).await
    } else {
        serve_http(addr, Arc::clone(&delegate)).await
    };

    info!("shutting down, draining backends");
    proxy.close().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "server error");
            ExitCode::FAILURE
        }
    }
}

/// Serve plain HTTP until a shutdown signal arrives.
async fn serve_http(addr: SocketAddr, delegate: Arc<HttpDelegate>) -> Result<(), BoxError> {
    let make_svc = make_service_fn(move |_conn| {
        let delegate = Arc::clone(&delegate);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let delegate = Arc::clone(&delegate);
                async move {
                    let resp = match delegate.route(req).await {
                        Ok(resp) => resp,
                        Err(e) => error_response(&e),
                    };
                    Ok::<_, Infallible>(resp)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "proxy listening");

    server.with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// Serve the front door over TLS with the configured certificate, accepting
/// connections until a shutdown signal arrives. In-flight connections finish
/// on their own tasks.
async fn serve_https(
    addr: SocketAddr,
    cfg: &ProxyConfig,
    delegate: Arc<HttpDelegate>,
) -> Result<(), BoxError> {
    let tls = load_tls_config(&cfg.https_cert, &cfg.https_key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "proxy listening (https)");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let delegate = Arc::clone(&delegate);
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(error) => {
                    debug!(%error, %peer, "tls handshake failed");
                    return;
                }
            };

            let service = service_fn(move |req: Request<Body>| {
                let delegate = Arc::clone(&delegate);
                async move {
                    let resp = match delegate.route(req).await {
                        Ok(resp) => resp,
                        Err(e) => error_response(&e),
                    };
                    Ok::<_, Infallible>(resp)
                }
            });
            if let Err(error) = Http::new().serve_connection(stream, service).await {
                debug!(%error, %peer, "connection error");
            }
        });
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<ProxyConfig, BoxError> {
    let raw = std::fs::read(path)?;
    let mut cfg: ProxyConfig = serde_json::from_slice(&raw)?;
    cfg.normalize();
    cfg.validate()?;
    Ok(cfg)
}

/// Build the listener's rustls config from PEM certificate and key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig, BoxError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(format!("no certificate found in {cert_path}").into());
    }

    let key = load_private_key(key_path)?;

    let tls = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(tls)
}

/// Read the first PKCS#8, RSA or EC private key from a PEM file.
fn load_private_key(path: &str) -> Result<rustls::PrivateKey, BoxError> {
    let mut reader = BufReader::new(File::open(path)?);
    for item in rustls_pemfile::read_all(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(rustls::PrivateKey(key)),
            _ => {}
        }
    }
    Err(format!("no private key found in {path}").into())
}

/// Parse the configured listen address, accepting the `:port` shorthand.
fn listen_addr(addr: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if let Some(port) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{port}").parse();
    }
    addr.parse()
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
