//! Change propagation
//!
//! ```text
//!   admin                              workers
//!   save ──► ConfigStore               ChangeSubscriber ──► ReloadHandler
//!     │                                     ▲    │
//!     └──► ChangePublisher ── channel ──────┘    └── reconcile timer
//! ```
//!
//! Pub/sub is lossy, so every subscriber also polls revisions on a timer
//! and re-subscribes when its stream ends.

pub mod notification;
pub mod packages;
pub mod publisher;
pub mod subscriber;

pub use notification::ChangeNotification;
pub use packages::{PackageInstaller, PackageSubscriber};
pub use publisher::ChangePublisher;
pub use subscriber::{ChangeSubscriber, ConfigUpdate, ReloadHandler};

use crate::common::utils::jitter;
use crate::common::Config;
use crate::storage::ResourceKind;
use crate::transport::{Message, Subscription, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Channel names per resource kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    prefix: String,
    update_channel: String,
    package_channel: String,
}

impl Channels {
    pub fn new(
        prefix: impl Into<String>,
        update_channel: impl Into<String>,
        package_channel: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            update_channel: update_channel.into(),
            package_channel: package_channel.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.key_prefix.clone(),
            config.update_channel.clone(),
            config.package_channel.clone(),
        )
    }

    /// Flows and packages have configurable channels; other kinds use `{prefix}{kind}:updated`.
    pub fn channel(&self, kind: ResourceKind) -> String {
        match kind {
            ResourceKind::Flows => self.update_channel.clone(),
            ResourceKind::Packages => self.package_channel.clone(),
            other => format!("{}{}:updated", self.prefix, other),
        }
    }

    /// Resource kind carried by `channel`
    pub fn kind_of(&self, channel: &str) -> Option<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| self.channel(*kind) == channel)
    }
}

/// A subscriber driven by [`drive`]
#[async_trait]
pub(crate) trait Reactor: Send + Sync {
    fn name(&self) -> &'static str;

    fn channels(&self) -> Vec<String>;

    async fn on_message(&self, message: Message);

    /// Poll-and-compare against the store
    async fn reconcile(&self);
}

enum Event {
    Shutdown,
    Tick,
    Received(Option<Message>),
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<Message> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Subscribe, prime, then react to messages and reconcile ticks until `shutdown`.
pub(crate) async fn drive<R>(
    reactor: Arc<R>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    shutdown: CancellationToken,
) where
    R: Reactor + ?Sized,
{
    let channels = reactor.channels();
    let mut subscription: Option<Subscription> = None;
    let start = Instant::now() + interval + jitter(interval / 10);
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut primed = false;

    loop {
        if subscription.is_none() {
            match transport.subscribe(&channels).await {
                Ok(s) => {
                    tracing::info!("{} subscribed to {}", reactor.name(), channels.join(", "));
                    subscription = Some(s);
                    // catch up on anything missed while unsubscribed
                    reactor.reconcile().await;
                    primed = true;
                }
                Err(e) => {
                    tracing::warn!("{} could not subscribe, retrying on next tick: {}", reactor.name(), e);
                    if !primed {
                        reactor.reconcile().await;
                        primed = true;
                    }
                }
            }
        }

        let event = tokio::select! {
            _ = shutdown.cancelled() => Event::Shutdown,
            _ = ticker.tick() => Event::Tick,
            message = next_message(&mut subscription) => Event::Received(message),
        };

        match event {
            Event::Shutdown => break,
            Event::Tick => reactor.reconcile().await,
            Event::Received(Some(message)) => reactor.on_message(message).await,
            Event::Received(None) => {
                tracing::warn!("{} subscription dropped", reactor.name());
                subscription = None;
                // wait for the next tick before re-subscribing
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }
        }
    }
    tracing::debug!("{} stopped", reactor.name());
}
