//! Fans lifecycle events out to the live connections of the author's friends.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::application::repos::{FriendsRepo, RepoError};
use crate::config::{EventSettings, QueueSettings};
use crate::domain::events::{LifecycleEvent, LivePushMessage};
use crate::events::{EventBus, EventBusError, EventEnvelope, EventSubscription};
use crate::infra::telemetry::METRIC_EVENTS;
use crate::realtime::{ConnectionRegistry, PushOutcome};

const DEFAULT_CONSUMER: &str = "notifier";

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub error_backoff: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            group: "feed-updaters".to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            batch_size: 32,
            block: Duration::from_secs(2),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl NotifierConfig {
    pub fn from_settings(events: &EventSettings, queue: &QueueSettings) -> Self {
        Self {
            group: events.group.clone(),
            consumer: DEFAULT_CONSUMER.to_string(),
            batch_size: events.batch_size.get(),
            block: events.block,
            error_backoff: queue.error_backoff,
        }
    }
}

/// Per-event fan-out tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub not_connected: usize,
    pub failed: usize,
}

pub struct Notifier {
    bus: Arc<dyn EventBus>,
    friends: Arc<dyn FriendsRepo>,
    registry: Arc<ConnectionRegistry>,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(
        bus: Arc<dyn EventBus>,
        friends: Arc<dyn FriendsRepo>,
        registry: Arc<ConnectionRegistry>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            bus,
            friends,
            registry,
            config,
        }
    }

    /// Joins the consumer group, then handles events until `cancel` fires.
    ///
    /// Broker failures never end the loop. A failed subscribe or read is retried after
    /// `error_backoff`, and a lost group is recreated by subscribing again.
    pub async fn run(&self, cancel: CancellationToken) {
        'subscribe: loop {
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                subscribed = self.bus.subscribe(&self.config.group, &self.config.consumer) => subscribed,
            };
            let mut subscription = match subscribed {
                Ok(subscription) => subscription,
                Err(err) => {
                    counter!(METRIC_EVENTS, "outcome" => "subscribe_error").increment(1);
                    warn!(group = %self.config.group, error = %err, "Event subscribe failed; backing off");
                    if self.back_off(&cancel).await {
                        continue;
                    }
                    break;
                }
            };
            info!(
                group = %self.config.group,
                partitions = self.bus.partitions(),
                "Notifier subscribed"
            );

            loop {
                let batch = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'subscribe,
                    batch = subscription.next_batch(self.config.batch_size, self.config.block) => batch,
                };

                match batch {
                    Ok(envelopes) => {
                        for envelope in &envelopes {
                            self.handle(subscription.as_mut(), envelope).await;
                        }
                    }
                    Err(EventBusError::MissingGroup { group }) => {
                        warn!(%group, "Consumer group is gone; subscribing again");
                        if self.back_off(&cancel).await {
                            continue 'subscribe;
                        }
                        break 'subscribe;
                    }
                    Err(err) => {
                        warn!(error = %err, "Event read failed; backing off");
                        if !self.back_off(&cancel).await {
                            break 'subscribe;
                        }
                    }
                }
            }
        }

        info!("Notifier stopped");
    }

    /// Waits out `error_backoff`. False when `cancel` fired first.
    async fn back_off(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.error_backoff) => true,
        }
    }

    async fn handle(&self, subscription: &mut dyn EventSubscription, envelope: &EventEnvelope) {
        let outcome = match serde_json::from_slice::<LifecycleEvent>(&envelope.payload) {
            Err(err) => {
                warn!(
                    partition = envelope.partition,
                    entry_id = %envelope.id,
                    error = %err,
                    "Dropping undecodable lifecycle event"
                );
                "poison"
            }
            Ok(event) => match self.notify(&event).await {
                Ok(_) => "notified",
                Err(err) => {
                    warn!(
                        author_id = %event.author_id,
                        post_id = %event.post_id,
                        error = %err,
                        "Friend lookup failed; event skipped"
                    );
                    "lookup_failed"
                }
            },
        };
        counter!(METRIC_EVENTS, "outcome" => outcome).increment(1);

        if let Err(err) = subscription.commit(envelope).await {
            warn!(entry_id = %envelope.id, error = %err, "Event commit failed");
        }
    }

    /// Pushes `event` to every connected friend of its author. One friend's failed push never
    /// stops the others.
    #[instrument(skip(self, event), fields(author_id = %event.author_id, post_id = %event.post_id))]
    pub async fn notify(&self, event: &LifecycleEvent) -> Result<FanOut, RepoError> {
        let friend_ids = self.friends.friend_ids(event.author_id).await?;
        let message = LivePushMessage::from(event);

        let mut fan_out = FanOut::default();
        for friend_id in friend_ids {
            match self.registry.push(friend_id, &message).await {
                Ok(PushOutcome::Delivered) => fan_out.delivered += 1,
                Ok(PushOutcome::NotConnected) => fan_out.not_connected += 1,
                Err(_) => fan_out.failed += 1,
            }
        }

        debug!(
            action = event.action.as_str(),
            delivered = fan_out.delivered,
            not_connected = fan_out.not_connected,
            failed = fan_out.failed,
            "Event fanned out"
        );
        Ok(fan_out)
    }
}
