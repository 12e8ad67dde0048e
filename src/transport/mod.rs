//! Moves batches between nodes over line-framed TCP sessions.
//!
//! A node pushes its batches to targets it is configured to push to, pulls
//! batches from sources it is configured to pull from, and serves both kinds
//! of session to its peers. Any transport failure leaves batch status as it
//! was; the next cycle resends.

pub mod extractor;
pub mod pull;
pub mod push;
pub mod server;
pub mod wire;

pub use extractor::Extractor;
pub use pull::{PullService, PullSummary};
pub use push::{PushService, PushSummary};
pub use server::TransportServer;
pub use wire::{BatchFrame, FrameReader, FrameWriter, Message, SessionKind, WireRecord};

use std::time::Duration;
use tokio::net::TcpStream;

use crate::model::Node;
use crate::{Error, Result};

/// Opens a session stream to `node`, bounded by `timeout`.
pub(crate) async fn connect(node: &Node, timeout: Duration) -> Result<TcpStream> {
    let address = node.address.as_deref().ok_or_else(|| {
        Error::Config(format!("node {} has no transport address", node.node_id))
    })?;
    let stream = wire::with_timeout(timeout, "connect", async {
        TcpStream::connect(address)
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", address, e)))
    })
    .await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
