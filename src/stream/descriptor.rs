//! JSON payload carried by CONNECT-kind frames.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use serde::{Deserialize, Serialize};

use super::message::{Message, MessageType};
use crate::error::Result;

/// Where the edge should send the request. Serialized as
/// `{"scheme", "host", "path", "rawQuery"?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetUrl {
    pub scheme: String,
    pub host: String,
    pub path: String,
    #[serde(rename = "rawQuery", default, skip_serializing_if = "String::is_empty")]
    pub raw_query: String,
}

impl TargetUrl {
    /// Path and query of `uri`, addressed to `scheme://host`.
    pub fn from_uri(uri: &Uri, scheme: &str, host: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            path: uri.path().to_string(),
            raw_query: uri.query().unwrap_or_default().to_string(),
        }
    }

    /// `path?query`, suitable for an HTTP request line.
    pub fn path_and_query(&self) -> String {
        if self.raw_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query)
        }
    }
}

impl std::fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path_and_query())
    }
}

/// Connection descriptor sent to the edge as the first frame of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectDescriptor {
    #[serde(rename = "messID")]
    pub message_id: u64,
    pub method: String,
    pub url: TargetUrl,
    #[serde(default)]
    pub header: BTreeMap<String, Vec<String>>,
    /// Upstream RTSP URL; video streams only.
    #[serde(rename = "resourceUrl", default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
}

impl ConnectDescriptor {
    pub fn new(method: &Method, url: TargetUrl, headers: &HeaderMap) -> Self {
        Self {
            message_id: 0,
            method: method.as_str().to_string(),
            url,
            header: headers_to_map(headers),
            resource_url: None,
        }
    }

    /// Serialize into the CONNECT frame of the given kind.
    pub fn to_message(&self, kind: MessageType) -> Result<Message> {
        let data = serde_json::to_vec(self)?;
        Ok(Message::new(self.message_id, kind, data))
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(serde_json::from_slice(&message.data)?)
    }

    /// Rebuild the header map on the edge. Invalid names or values are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.header {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }
}

/// Request headers in canonical MIME form, without `Host` (the target URL
/// carries it).
fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if name == axum::http::header::HOST {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        map.entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(value.to_string());
    }
    map
}

/// `x-stream-protocol-version` -> `X-Stream-Protocol-Version`.
pub fn canonical_header_key(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
