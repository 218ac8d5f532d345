//! PLC protocol link
//!
//! The protocol driver that talks to the PLC is an external collaborator. This module
//! defines the seam it plugs into and the data it produces:
//!
//! - [`ProtocolLink`]: async, thread-safe register-level driver (`read_block`,
//!   `write_word`). Every call made by the core is wrapped in a timeout with
//!   [`with_timeout`], so a hung driver surfaces as [`LinkError::Timeout`].
//! - [`RawBlock`]: the bytes of one polled data block plus capture time.
//! - [`RawFrame`]: one demultiplexed snapshot of all channels, produced by
//!   [`layout::BlockLayout::decode`]. Immutable once produced.
//!
//! # Thread Safety
//! - All methods take `&self`; drivers use interior mutability for connection state
//! - The poller, the pipeline write-back and the health monitor share one
//!   `Arc<dyn ProtocolLink>`

pub mod layout;
pub mod mock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{LinkConfig, LinkMode};
use crate::error::LinkError;

/// Channel (test cavity) index, zero-based
pub type ChannelId = u16;

/// One polled data block as returned by the driver
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Block contents, starting at the configured offset
    pub bytes: Bytes,
    /// Time the block was captured
    pub captured_at: DateTime<Utc>,
}

/// One channel's readings at one poll tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSample {
    /// Channel the reading belongs to
    pub channel: ChannelId,
    /// Poll tick that produced the reading
    pub tick: u64,
    /// Capture timestamp of the enclosing frame
    pub captured_at: DateTime<Utc>,
    /// Raw analog input value
    pub ai: i16,
    /// Cavity pressure
    pub pressure: f64,
    /// Fixture position
    pub position: i16,
    /// Fixture angle
    pub angle: f64,
    /// Test-active status bit, if the block layout carries one
    pub status: Option<bool>,
}

/// A demultiplexed snapshot of all channels at one poll tick
#[derive(Debug, Clone)]
pub struct RawFrame {
    tick: u64,
    captured_at: DateTime<Utc>,
    samples: Vec<ChannelSample>,
}

impl RawFrame {
    /// Build a frame from per-channel samples, ordered by channel
    pub fn new(tick: u64, captured_at: DateTime<Utc>, mut samples: Vec<ChannelSample>) -> Self {
        samples.sort_by_key(|s| s.channel);
        Self {
            tick,
            captured_at,
            samples,
        }
    }

    /// Poll tick index
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Capture timestamp
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Per-channel samples in channel order
    pub fn samples(&self) -> &[ChannelSample] {
        &self.samples
    }
}

/// Register-level PLC driver.
#[async_trait]
pub trait ProtocolLink: Send + Sync {
    /// Short driver name for logs
    fn name(&self) -> &str;

    /// Whether the driver believes the connection is up
    fn is_connected(&self) -> bool;

    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<(), LinkError>;

    /// Drop the connection. Never fails.
    async fn disconnect(&self);

    /// Read the configured data block
    async fn read_block(&self) -> Result<RawBlock, LinkError>;

    /// Write one big-endian 16-bit word at `offset` within data block `db`
    async fn write_word(&self, db: u16, offset: usize, value: i16) -> Result<(), LinkError>;
}

/// Link used when no driver is configured; every operation fails with `NotConnected`
#[derive(Debug, Default)]
pub struct OfflineLink;

#[async_trait]
impl ProtocolLink for OfflineLink {
    fn name(&self) -> &str {
        "offline"
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), LinkError> {
        Err(LinkError::NotConnected)
    }

    async fn disconnect(&self) {}

    async fn read_block(&self) -> Result<RawBlock, LinkError> {
        Err(LinkError::NotConnected)
    }

    async fn write_word(&self, _db: u16, _offset: usize, _value: i16) -> Result<(), LinkError> {
        Err(LinkError::NotConnected)
    }
}

/// Build the link selected by `config.mode`
pub fn from_config(config: &LinkConfig) -> Arc<dyn ProtocolLink> {
    match config.mode {
        LinkMode::Mock => Arc::new(mock::MockLink::new(config.layout.clone())),
        LinkMode::None => Arc::new(OfflineLink),
    }
}

/// Run a link operation with a deadline.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, LinkError>
where
    F: Future<Output = Result<T, LinkError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::Timeout { operation, timeout }),
    }
}
