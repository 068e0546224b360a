//! Accept loop shared by the tunnel and stream servers: TCP, optional TLS,
//! then a hyper HTTP/1 connection with upgrades serving an axum router.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Per-listener connection settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOptions {
    /// TCP keepalive applied to every accepted socket.
    pub keepalive: Option<Duration>,
    /// Bound on reading a request head.
    pub header_read_timeout: Option<Duration>,
}

impl ListenerOptions {
    /// Edge-facing: WebSocket handshakes must complete within 2 s.
    pub fn tunnel() -> Self {
        Self {
            keepalive: None,
            header_read_timeout: Some(Duration::from_secs(2)),
        }
    }

    /// API-server-facing: exec/attach sockets keep TCP keepalive (30 s).
    pub fn stream() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(30)),
            header_read_timeout: None,
        }
    }
}

/// Accept connections until `shutdown` fires.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    router: Router,
    options: ListenerOptions,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(listener = name, %addr, tls = tls.is_some(), "listening");
    }
    loop {
        let (stream, remote) = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(listener = name, "accept failed: {e}");
                    continue;
                }
            },
        };
        if let Some(idle) = options.keepalive {
            if let Err(e) = set_keepalive(&stream, idle) {
                warn!(listener = name, %remote, "failed to set keepalive: {e}");
            }
        }

        let router = router.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, remote, router, options).await,
                    Err(e) => debug!(listener = name, %remote, "tls handshake failed: {e}"),
                },
                None => serve_connection(stream, remote, router, options).await,
            }
        });
    }
    info!(listener = name, "stopped accepting");
}

fn set_keepalive(stream: &TcpStream, idle: Duration) -> std::io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle).with_interval(idle))
}

async fn serve_connection<I>(io: I, remote: SocketAddr, router: Router, options: ListenerOptions)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = router.map_request(move |mut req: axum::http::Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(remote));
        req
    });

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder.timer(TokioTimer::new());
    if let Some(timeout) = options.header_read_timeout {
        builder.header_read_timeout(timeout);
    }
    if let Err(e) = builder
        .serve_connection(TokioIo::new(io), TowerToHyperService::new(service))
        .with_upgrades()
        .await
    {
        debug!(%remote, "connection ended: {e}");
    }
}
