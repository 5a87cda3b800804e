//! Transport strategies
//!
//! A session talks to the authority either over a push channel, which carries
//! discrete operations both ways, or by polling full snapshots. Which one is
//! decided once by [`probe`] when the session opens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::SyncConfig;
use crate::error::{CollabError, Result};
use crate::protocol::{EditMessage, FeedEvent, OutboundMessage};
use crate::store::{DocumentStore, PushChannel, PushConnector};
use crate::{DocumentId, Snapshot, UserId};

/// Connectivity as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Push channel up; edits sync as operations
    Live,
    /// No push channel; snapshots are polled
    Polling,
    Closed,
}

/// Something arriving from the authority
#[derive(Debug, Clone)]
pub enum Inbound {
    Event(FeedEvent),
    /// A polled snapshot
    Snapshot(Snapshot),
    /// The push channel closed
    Disconnected,
}

/// How a session exchanges data with the authority
#[async_trait]
pub trait SyncStrategy: Send {
    fn status(&self) -> SyncStatus;

    async fn transmit(&mut self, edits: Vec<EditMessage>) -> Result<()>;

    /// Wait for the next inbound item. Must be cancel-safe: the session
    /// drops this future whenever another event wins the select.
    async fn next_inbound(&mut self) -> Inbound;
}

/// Operations over a live push channel, with a keepalive ping
pub struct PushStrategy {
    channel: PushChannel,
    heartbeat: Interval,
}

impl PushStrategy {
    pub fn new(channel: PushChannel, heartbeat: Duration) -> Self {
        let mut heartbeat = interval_at(Instant::now() + heartbeat, heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { channel, heartbeat }
    }
}

#[async_trait]
impl SyncStrategy for PushStrategy {
    fn status(&self) -> SyncStatus {
        SyncStatus::Live
    }

    async fn transmit(&mut self, edits: Vec<EditMessage>) -> Result<()> {
        for edit in edits {
            self.channel
                .outbound
                .send(OutboundMessage::Edit(edit))
                .map_err(|_| CollabError::TransportUnavailable("push channel closed".into()))?;
        }
        Ok(())
    }

    async fn next_inbound(&mut self) -> Inbound {
        loop {
            tokio::select! {
                event = self.channel.inbound.recv() => {
                    return match event {
                        Some(event) => Inbound::Event(event),
                        None => Inbound::Disconnected,
                    };
                }
                _ = self.heartbeat.tick() => {
                    trace!("heartbeat");
                    if self.channel.outbound.send(OutboundMessage::Ping).is_err() {
                        return Inbound::Disconnected;
                    }
                }
            }
        }
    }
}

/// Snapshot polling against the store
pub struct PollingStrategy {
    store: Arc<dyn DocumentStore>,
    document: DocumentId,
    poll: Interval,
}

impl PollingStrategy {
    pub fn new(store: Arc<dyn DocumentStore>, document: DocumentId, interval: Duration) -> Self {
        let mut poll = interval_at(Instant::now() + interval, interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { store, document, poll }
    }
}

#[async_trait]
impl SyncStrategy for PollingStrategy {
    fn status(&self) -> SyncStatus {
        SyncStatus::Polling
    }

    async fn transmit(&mut self, edits: Vec<EditMessage>) -> Result<()> {
        for edit in edits {
            self.store.submit_edit(edit).await?;
        }
        Ok(())
    }

    async fn next_inbound(&mut self) -> Inbound {
        loop {
            self.poll.tick().await;
            match self.store.fetch_snapshot(self.document).await {
                Ok(snapshot) => return Inbound::Snapshot(snapshot),
                Err(e) => warn!(document = %self.document, error = %e, "snapshot poll failed"),
            }
        }
    }
}

/// Try the push connector up to `reconnect_attempts` times with linear backoff
pub async fn connect_with_backoff(
    config: &SyncConfig,
    connector: &dyn PushConnector,
    document: DocumentId,
    user: UserId,
) -> Result<PushChannel> {
    let mut last_error = String::from("no attempt made");
    for attempt in 1..=config.reconnect_attempts {
        match tokio::time::timeout(config.connect_timeout, connector.connect(document, user)).await {
            Ok(Ok(channel)) => {
                debug!(%document, attempt, "push channel connected");
                return Ok(channel);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", config.connect_timeout),
        }
        debug!(%document, attempt, error = %last_error, "push connection attempt failed");
        if attempt < config.reconnect_attempts {
            tokio::time::sleep(config.backoff(attempt)).await;
        }
    }
    Err(CollabError::TransportUnavailable(last_error))
}

/// Pick the strategy for a new session
pub async fn probe(
    config: &SyncConfig,
    store: Arc<dyn DocumentStore>,
    connector: &dyn PushConnector,
    document: DocumentId,
    user: UserId,
) -> Box<dyn SyncStrategy> {
    match connect_with_backoff(config, connector, document, user).await {
        Ok(channel) => Box::new(PushStrategy::new(channel, config.heartbeat)),
        Err(e) => {
            warn!(%document, error = %e, "falling back to snapshot polling");
            Box::new(PollingStrategy::new(store, document, config.poll_interval))
        }
    }
}
