mod ingress;
mod peer;
mod session;
mod signaling;
mod tls;
mod track;
mod user;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rivulet_protocol::Config;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::ingress::TrackKind;
use crate::session::SessionRegistry;
use crate::web::AppState;

/// Periodic reap interval for users/sessions left behind by an abrupt
/// disconnect. A pure event-driven sweep misses users who silently stop
/// sending traffic without ever completing their close handshake. See
/// DESIGN.md.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!("configuration has fatal issues, refusing to start");
            std::process::exit(1);
        }
    }
    let config = Arc::new(config);

    let registry = Arc::new(SessionRegistry::new(
        config.rtc.video_codec.clone(),
        config.rtc.audio_codec.clone(),
    ));

    tokio::spawn(ingress::run(
        TrackKind::Video,
        config.rtc.video_tracks_receive_port,
        config.rtc.receive_rtp_buffsize as usize,
        Arc::clone(&registry),
    ));
    tokio::spawn(ingress::run(
        TrackKind::Audio,
        config.rtc.audio_tracks_receive_port,
        config.rtc.receive_rtp_buffsize as usize,
        Arc::clone(&registry),
    ));

    let sweep_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweep_registry.sweep();
        }
    });

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        registry,
    });

    let app = web::build_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::DEBUG, "started");
                }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let bind_addr: SocketAddr = config
        .http
        .local_server_location
        .parse()
        .with_context(|| format!("invalid HTTP_LOCAL_SERVER_LOCATION '{}'", config.http.local_server_location))?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    if config.http.tls_enabled() {
        let cert = config.http.tls_cert_file_location.as_deref().unwrap();
        let key = config.http.tls_key_file_location.as_deref().unwrap();
        let tls_config = tls::build_tls_config(cert, key)?;
        let acceptor = tls::make_acceptor(tls_config);
        tracing::info!("listening on https://{bind_addr}");
        serve_tls(listener, acceptor, app).await
    } else {
        tracing::info!("listening on http://{bind_addr}");
        axum::serve(listener, app)
            .await
            .context("server exited with an error")
    }
}

/// Manual TLS-terminated accept loop: axum's `serve` has no built-in TLS
/// support, so each accepted connection is handshaken with `tls_acceptor`
/// before being handed to the hyper service.
async fn serve_tls(
    listener: TcpListener,
    tls_acceptor: tokio_rustls::TlsAcceptor,
    app: axum::Router,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("failed to accept TCP connection: {e}");
                continue;
            }
        };

        let acceptor = tls_acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match tokio::time::timeout(Duration::from_secs(10), acceptor.accept(stream)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                    return;
                }
                Err(_) => {
                    tracing::debug!(%peer_addr, "TLS handshake timed out");
                    return;
                }
            };

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let hyper_service = hyper_util::service::TowerToHyperService::new(app);
            let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());

            if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                tracing::debug!(%peer_addr, "connection error: {e}");
            }
        });
    }
}
