use anyhow::Context;
use nimbus_common::bus::{EventEnvelope, EventType, CHANNEL_EVENTS};
use redis::AsyncCommands;

use crate::hub::HubHandle;

const SOURCE: &str = "orchestrator";

/// Publishes domain events to the websocket hub and the Redis channel.
/// Either sink may be absent; publishing never fails the caller.
#[derive(Clone, Default)]
pub struct EventPublisher {
    hub: Option<HubHandle>,
    redis: Option<redis::Client>,
}

impl EventPublisher {
    pub fn new(hub: Option<HubHandle>, redis: Option<redis::Client>) -> Self {
        Self { hub, redis }
    }

    pub async fn publish(&self, event_type: EventType, payload: serde_json::Value) {
        let envelope = EventEnvelope::new(event_type, payload, SOURCE);
        let text = match serde_json::to_string(&envelope) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(event = event_type.as_str(), error = %e, "failed to encode event");
                return;
            }
        };

        if let Some(hub) = &self.hub {
            hub.broadcast(text.as_str()).await;
        }
        if let Some(client) = &self.redis {
            if let Err(e) = publish_redis(client, &text).await {
                tracing::warn!(event = event_type.as_str(), error = %e, "event not published to redis");
            }
        }
    }
}

async fn publish_redis(client: &redis::Client, payload: &str) -> anyhow::Result<()> {
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis (publisher)")?;
    let _: () = conn.publish(CHANNEL_EVENTS, payload).await?;
    Ok(())
}
