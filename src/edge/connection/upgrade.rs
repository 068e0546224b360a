//! Exec and attach: send the upgrade request to the kubelet over a hyper
//! HTTP/1 client connection, relay the response head back as DATA, then pump
//! the upgraded connection both ways. The cloud parses the head.

use axum::http::{header, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::http::{relay_body, upstream};
use super::{EdgeRequest, READ_CHUNK};
use crate::error::{Result, TunnelError};
use crate::stream::{ConnectDescriptor, Message, MessageType};

/// `METHOD /path?query` with `Host` and the descriptor's headers.
fn build_request(descriptor: &ConnectDescriptor) -> Result<Request<Empty<Bytes>>> {
    let method = Method::from_bytes(descriptor.method.as_bytes()).map_err(upstream)?;
    let mut req = Request::builder()
        .method(method)
        .uri(descriptor.url.path_and_query())
        .body(Empty::new())
        .map_err(upstream)?;
    *req.headers_mut() = descriptor.header_map();
    req.headers_mut().insert(
        header::HOST,
        HeaderValue::from_str(&descriptor.url.host).map_err(upstream)?,
    );
    Ok(req)
}

/// Status line and headers of `response`, as sent on the wire.
fn response_head<B>(response: &Response<B>) -> Vec<u8> {
    let status = response.status();
    let mut head = format!(
        "{:?} {} {}\r\n",
        response.version(),
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in response.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

pub async fn serve(request: &mut EdgeRequest) -> Result<()> {
    let host = request.descriptor.url.host.clone();
    let stream = tokio::select! {
        () = request.stop.cancelled() => return Ok(()),
        stream = TcpStream::connect(&host) => {
            stream.map_err(|e| TunnelError::Upstream(format!("dial {host}: {e}")))?
        }
    };
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.map_err(upstream)?;
    let id = request.id;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(message_id = id, "kubelet connection ended: {e}");
        }
    });

    let req = build_request(&request.descriptor)?;
    let response = tokio::select! {
        () = request.stop.cancelled() => return Ok(()),
        response = sender.send_request(req) => response.map_err(upstream)?,
    };
    debug!(message_id = id, status = %response.status(), "kubelet answered upgrade");
    request.send_data(Bytes::from(response_head(&response))).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return relay_body(request, response.into_body()).await;
    }
    let upgraded = tokio::select! {
        () = request.stop.cancelled() => return Ok(()),
        upgraded = hyper::upgrade::on(response) => upgraded.map_err(upstream)?,
    };
    let result = pump(request, TokioIo::new(upgraded)).await;
    debug!(message_id = id, "upgraded stream finished");
    result
}

/// Copy `io` to the tunnel and inbound DATA to `io` until either side ends.
async fn pump<T>(request: &mut EdgeRequest, io: T) -> Result<()>
where
    T: AsyncRead + AsyncWrite,
{
    let (mut remote_reader, mut remote_writer) = tokio::io::split(io);
    let EdgeRequest {
        id,
        tunnel,
        inbound,
        stop,
        ..
    } = request;
    let id = *id;

    let remote_to_tunnel = async {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = remote_reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, TunnelError>(());
            }
            tunnel
                .write_message(&Message::data(id, Bytes::copy_from_slice(&buf[..n])))
                .await?;
        }
    };

    let tunnel_to_remote = async {
        while let Some(message) = inbound.recv().await {
            if message.message_type != MessageType::Data {
                continue;
            }
            remote_writer.write_all(&message.data).await?;
        }
        Ok::<_, TunnelError>(())
    };

    tokio::select! {
        () = stop.cancelled() => Ok(()),
        result = remote_to_tunnel => result,
        result = tunnel_to_remote => result,
    }
}
