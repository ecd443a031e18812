use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_EVENTS: &str = "nimbus_events";

// -----------------------------------------------------------------------------
// Domain events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "EVT:INSTANCE_STATE")]
    InstanceState,
    #[serde(rename = "EVT:INSTANCE_ERROR")]
    InstanceError,
    #[serde(rename = "EVT:LB_DEPLOYED")]
    LbDeployed,
    #[serde(rename = "EVT:LB_REMOVED")]
    LbRemoved,
    #[serde(rename = "EVT:SCALING_ACTION")]
    ScalingAction,
    #[serde(rename = "EVT:CRON_FIRED")]
    CronFired,
    #[serde(rename = "EVT:DEPLOYMENT_SCALED")]
    DeploymentScaled,
    #[serde(rename = "EVT:DNS_RECORD")]
    DnsRecord,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InstanceState => "EVT:INSTANCE_STATE",
            EventType::InstanceError => "EVT:INSTANCE_ERROR",
            EventType::LbDeployed => "EVT:LB_DEPLOYED",
            EventType::LbRemoved => "EVT:LB_REMOVED",
            EventType::ScalingAction => "EVT:SCALING_ACTION",
            EventType::CronFired => "EVT:CRON_FIRED",
            EventType::DeploymentScaled => "EVT:DEPLOYMENT_SCALED",
            EventType::DnsRecord => "EVT:DNS_RECORD",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub source: String,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            occurred_at: Utc::now(),
            payload,
            source: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_type_tag() {
        let env = EventEnvelope::new(
            EventType::InstanceState,
            serde_json::json!({"state": "running"}),
            "orchestrator",
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "EVT:INSTANCE_STATE");
        assert_eq!(v["payload"]["state"], "running");
        assert_eq!(EventType::CronFired.as_str(), "EVT:CRON_FIRED");
    }
}
