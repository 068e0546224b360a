#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! edgestream library: the building blocks of the cloud/edge streaming proxy.
//!
//! - `stream`: frame codec, connect descriptors and the write-serialized tunnel
//! - `cloud`: tunnel server, stream server, sessions and per-request relays
//! - `edge`: tunnel client and the kubelet/transcoder pumps
//! - `tls`: certificate loading and the rustls configurations
//! - `config`: TOML configuration

pub mod cloud;
pub mod config;
pub mod edge;
pub mod error;
pub mod stream;
pub mod tls;
pub mod util;

pub use cloud::session::Session;
pub use cloud::tunnel_server::SessionRegistry;
pub use config::Config;
pub use error::{Result, TunnelError};
pub use stream::{ConnectDescriptor, Message, MessageType, SafeTunnel};
