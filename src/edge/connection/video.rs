//! Video: run the transcoder against the endpoint's RTSP URL and stream its
//! stdout back in 4 KiB DATA frames.

use std::process::Stdio;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{EdgeContext, EdgeRequest};
use crate::error::{Result, TunnelError};

const VIDEO_CHUNK: usize = 4096;

/// Transcoder argv with `{url}` substituted.
fn transcoder_args(ctx: &EdgeContext, url: &str) -> Vec<String> {
    ctx.transcoder_args.iter().map(|arg| arg.replace("{url}", url)).collect()
}

pub async fn serve(ctx: &EdgeContext, request: &mut EdgeRequest) -> Result<()> {
    let url = request
        .descriptor
        .resource_url
        .clone()
        .ok_or_else(|| TunnelError::Upstream("video request without resourceUrl".to_string()))?;

    let mut child = Command::new(&ctx.transcoder)
        .args(transcoder_args(ctx, &url))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TunnelError::Upstream(format!("spawn {}: {e}", ctx.transcoder)))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| TunnelError::Upstream("transcoder stdout not captured".to_string()))?;
    info!(message_id = request.id, url = %url, pid = child.id(), "transcoder started");

    let mut buf = vec![0u8; VIDEO_CHUNK];
    let result = loop {
        tokio::select! {
            biased;
            () = request.stop.cancelled() => break Ok(()),
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = request.send_data(Bytes::copy_from_slice(&buf[..n])).await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e.into()),
            },
            message = request.inbound.recv() => {
                if message.is_none() {
                    break Ok(());
                }
            }
        }
    };

    let _ = child.kill().await;
    debug!(message_id = request.id, "transcoder stopped");
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{HeaderMap, Method, Uri};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::edge::connection::HttpClient;
    use crate::stream::tunnel::memory_pair;
    use crate::stream::{ConnectDescriptor, MessageType, TargetUrl};

    fn context(program: &str, args: &[&str]) -> EdgeContext {
        let http: HttpClient =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        EdgeContext {
            http,
            transcoder: program.to_string(),
            transcoder_args: args.iter().map(ToString::to_string).collect(),
        }
    }

    fn video_descriptor(resource_url: Option<&str>) -> ConnectDescriptor {
        let uri: Uri = "/video/cam-1".parse().unwrap();
        let mut descriptor = ConnectDescriptor::new(
            &Method::GET,
            TargetUrl::from_uri(&uri, "http", "cloud"),
            &HeaderMap::new(),
        );
        descriptor.resource_url = resource_url.map(str::to_string);
        descriptor
    }

    #[test]
    fn test_url_placeholder_substituted() {
        let ctx = context("ffmpeg", &["-i", "{url}", "-f", "mpegts", "-"]);
        assert_eq!(
            transcoder_args(&ctx, "rtsp://cam/live"),
            vec!["-i", "rtsp://cam/live", "-f", "mpegts", "-"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_streamed_as_data() {
        let ctx = context("sh", &["-c", "printf '%s' '{url}'"]);
        let ((_cloud, mut cloud_reader), (edge_tunnel, _)) = memory_pair(1 << 20).await;
        let (_tx, inbound) = mpsc::channel(1);
        let mut request = EdgeRequest {
            id: 5,
            descriptor: video_descriptor(Some("rtsp://cam/live")),
            tunnel: Arc::new(edge_tunnel),
            inbound,
            stop: CancellationToken::new(),
        };
        serve(&ctx, &mut request).await.unwrap();

        let mut received = Vec::new();
        while received.len() < "rtsp://cam/live".len() {
            let msg = cloud_reader.next_message().await.unwrap();
            assert_eq!(msg.message_type, MessageType::Data);
            received.extend_from_slice(&msg.data);
        }
        assert_eq!(received, b"rtsp://cam/live");
    }

    #[tokio::test]
    async fn test_missing_resource_url() {
        let ctx = context("ffmpeg", &[]);
        let ((_cloud, _), (edge_tunnel, _)) = memory_pair(1024).await;
        let (_tx, inbound) = mpsc::channel(1);
        let mut request = EdgeRequest {
            id: 5,
            descriptor: video_descriptor(None),
            tunnel: Arc::new(edge_tunnel),
            inbound,
            stop: CancellationToken::new(),
        };
        assert!(matches!(serve(&ctx, &mut request).await, Err(TunnelError::Upstream(_))));
    }
}
