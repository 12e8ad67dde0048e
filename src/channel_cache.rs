//! Time-expiring cache of channel definitions.
//!
//! The cache is an owned object handed to the router and scheduler by `Arc`.
//! Reads serve the cached snapshot until the TTL runs out, then the next read
//! reloads from the [`ChannelSource`]. [`ChannelCache::reload`] forces a refresh.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::model::{Channel, NodeChannelControl};
use crate::{Error, Result};

/// Everything the cache holds, loaded together so readers see a consistent view.
#[derive(Debug, Clone, Default)]
pub struct ChannelSnapshot {
    pub channels: Vec<Channel>,
    pub node_channels: Vec<NodeChannelControl>,
}

#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn load(&self) -> Result<ChannelSnapshot>;
}

/// Fixed channel definitions.
pub struct StaticChannels(ChannelSnapshot);

impl StaticChannels {
    pub fn new(channels: Vec<Channel>, node_channels: Vec<NodeChannelControl>) -> Self {
        Self(ChannelSnapshot {
            channels,
            node_channels,
        })
    }
}

#[async_trait]
impl ChannelSource for StaticChannels {
    async fn load(&self) -> Result<ChannelSnapshot> {
        Ok(self.0.clone())
    }
}

/// Re-reads the `channels` and `node_channels` sections of a config file.
pub struct ConfigFileChannels {
    path: PathBuf,
}

impl ConfigFileChannels {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ChannelSource for ConfigFileChannels {
    async fn load(&self) -> Result<ChannelSnapshot> {
        let path = self.path.clone();
        let config = tokio::task::spawn_blocking(move || Config::from_file(path))
            .await
            .map_err(|e| Error::Config(format!("channel reload task failed: {}", e)))?
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(ChannelSnapshot {
            channels: config.channels,
            node_channels: config.node_channels,
        })
    }
}

struct Cached {
    channels: HashMap<String, Channel>,
    node_channels: HashMap<(String, String), NodeChannelControl>,
    loaded_at: Instant,
}

pub struct ChannelCache {
    source: Arc<dyn ChannelSource>,
    ttl: Duration,
    state: RwLock<Option<Cached>>,
}

impl ChannelCache {
    pub fn new(source: Arc<dyn ChannelSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Discards the cached snapshot and loads a fresh one.
    pub async fn reload(&self) -> Result<()> {
        let snapshot = self.source.load().await?;
        let cached = Cached {
            channels: snapshot
                .channels
                .into_iter()
                .map(|c| (c.channel_id.clone(), c))
                .collect(),
            node_channels: snapshot
                .node_channels
                .into_iter()
                .map(|c| ((c.node_id.clone(), c.channel_id.clone()), c))
                .collect(),
            loaded_at: Instant::now(),
        };
        info!(channels = cached.channels.len(), "Loaded channel definitions");
        *self.state.write().await = Some(cached);
        Ok(())
    }

    async fn ensure_fresh(&self) -> Result<()> {
        let stale = match self.state.read().await.as_ref() {
            Some(cached) => cached.loaded_at.elapsed() >= self.ttl,
            None => true,
        };
        if stale {
            debug!("Channel cache expired, reloading");
            self.reload().await?;
        }
        Ok(())
    }

    pub async fn get(&self, channel_id: &str) -> Result<Option<Channel>> {
        self.ensure_fresh().await?;
        let state = self.state.read().await;
        Ok(state
            .as_ref()
            .and_then(|c| c.channels.get(channel_id).cloned()))
    }

    pub async fn node_channel(
        &self,
        node_id: &str,
        channel_id: &str,
    ) -> Result<Option<NodeChannelControl>> {
        self.ensure_fresh().await?;
        let state = self.state.read().await;
        Ok(state.as_ref().and_then(|c| {
            c.node_channels
                .get(&(node_id.to_string(), channel_id.to_string()))
                .cloned()
        }))
    }
}
