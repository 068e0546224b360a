//! Edge-side pumps, one per CONNECT frame.
//!
//! - `http`: logs and metrics: plain HTTP to the kubelet, body streamed back
//! - `upgrade`: exec and attach: hyper client upgrade, pumped both ways
//! - `video`: transcoder subprocess stdout streamed back
//!
//! Every pump ends by sending REMOVE_CONNECT for its ID, whichever side
//! finished first.

pub mod http;
pub mod upgrade;
pub mod video;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EdgeConfig;
use crate::stream::{send_remove_connect, ConnectDescriptor, Message, MessageType, SafeTunnel};

/// Read size for upstream to tunnel copies (HTTP bodies, upgraded streams).
pub const READ_CHUNK: usize = 256;

pub type HttpClient = Client<HttpConnector, Empty<Bytes>>;

/// Shared by every pump of an edge process.
pub struct EdgeContext {
    pub http: HttpClient,
    pub transcoder: String,
    pub transcoder_args: Vec<String>,
}

impl EdgeContext {
    pub fn new(config: &EdgeConfig) -> Self {
        Self {
            http: Client::builder(TokioExecutor::new()).build_http(),
            transcoder: config.transcoder.clone(),
            transcoder_args: config.transcoder_args.clone(),
        }
    }
}

/// One request being served on the edge.
pub struct EdgeRequest {
    pub id: u64,
    pub descriptor: ConnectDescriptor,
    pub tunnel: Arc<SafeTunnel>,
    /// DATA frames the cloud sent for this ID.
    pub inbound: mpsc::Receiver<Message>,
    /// Fires on REMOVE_CONNECT or when the session ends.
    pub stop: CancellationToken,
}

impl EdgeRequest {
    async fn send_data(&self, data: Bytes) -> crate::error::Result<()> {
        self.tunnel.write_message(&Message::data(self.id, data)).await
    }
}

/// Run the pump matching `kind`, then send REMOVE_CONNECT.
pub async fn serve(ctx: Arc<EdgeContext>, kind: MessageType, mut request: EdgeRequest) {
    let id = request.id;
    info!(message_id = id, kind = kind.as_str(), url = %request.descriptor.url, "serving request");
    let result = match kind {
        MessageType::LogsConnect => http::serve(&ctx.http, &mut request, false).await,
        MessageType::MetricConnect => http::serve(&ctx.http, &mut request, true).await,
        MessageType::ExecConnect | MessageType::AttachConnect => upgrade::serve(&mut request).await,
        MessageType::VideoConnect => video::serve(&ctx, &mut request).await,
        other => {
            debug!(message_id = id, "no pump for {other}");
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(message_id = id, kind = kind.as_str(), "request failed: {e}");
    }
    send_remove_connect(&request.tunnel, id).await;
    info!(message_id = id, kind = kind.as_str(), "request done");
}
