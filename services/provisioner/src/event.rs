//! Trigger payloads.
//!
//! The provisioning workflow is triggered by an instance-launch lifecycle
//! notification. It arrives either wrapped in a notification envelope
//! (`Records[0].Sns.Message` carries the lifecycle message as a JSON string)
//! or as the bare lifecycle message. The snapshot workflow is triggered by a
//! schedule tick whose payload is only used for logging.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use voldr_id::InstanceId;

use crate::error::WorkflowError;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Records")]
    records: Vec<EnvelopeRecord>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeRecord {
    #[serde(rename = "Sns")]
    sns: EnvelopeMessage,
}

#[derive(Debug, Deserialize)]
struct EnvelopeMessage {
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "MessageAttributes", default)]
    message_attributes: HashMap<String, MessageAttribute>,
}

#[derive(Debug, Deserialize)]
struct MessageAttribute {
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct LifecycleMessage {
    #[serde(rename = "EC2InstanceId", default)]
    instance_id: Option<String>,
    #[serde(rename = "LifecycleTransition", default)]
    lifecycle_transition: Option<String>,
    #[serde(rename = "AutoScalingGroupName", default)]
    auto_scaling_group: Option<String>,
}

const INSTANCE_ID_ATTRIBUTE: &str = "EC2InstanceId";

/// An instance-launch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEvent {
    pub instance_id: InstanceId,
    pub lifecycle_transition: Option<String>,
    pub auto_scaling_group: Option<String>,
}

impl LaunchEvent {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            lifecycle_transition: None,
            auto_scaling_group: None,
        }
    }

    /// Parse raw trigger bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WorkflowError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| WorkflowError::InvalidEvent(format!("not JSON: {}", e)))?;
        Self::from_json(&value)
    }

    /// Parse an enveloped or bare lifecycle message. In an envelope the
    /// `EC2InstanceId` message attribute takes precedence over the body.
    pub fn from_json(value: &Value) -> Result<Self, WorkflowError> {
        let (message, attribute_id) = if value.get("Records").is_some() {
            let envelope = Envelope::deserialize(value)
                .map_err(|e| WorkflowError::InvalidEvent(format!("bad envelope: {}", e)))?;
            let record = envelope
                .records
                .into_iter()
                .next()
                .ok_or_else(|| WorkflowError::InvalidEvent("envelope has no records".into()))?;

            let message = match record.sns.message.as_deref() {
                // Test notifications and other non-JSON bodies carry no id.
                Some(body) => serde_json::from_str::<LifecycleMessage>(body).unwrap_or_default(),
                None => LifecycleMessage::default(),
            };
            let attribute_id = record
                .sns
                .message_attributes
                .get(INSTANCE_ID_ATTRIBUTE)
                .map(|a| a.value.clone());
            (message, attribute_id)
        } else {
            let message = LifecycleMessage::deserialize(value)
                .map_err(|e| WorkflowError::InvalidEvent(format!("bad message: {}", e)))?;
            (message, None)
        };

        let raw_id = attribute_id
            .or(message.instance_id)
            .ok_or_else(|| WorkflowError::InvalidEvent("no EC2InstanceId in event".into()))?;
        let instance_id = InstanceId::parse(&raw_id)
            .map_err(|e| WorkflowError::InvalidEvent(format!("bad instance id: {}", e)))?;

        Ok(Self {
            instance_id,
            lifecycle_transition: message.lifecycle_transition,
            auto_scaling_group: message.auto_scaling_group,
        })
    }
}

/// A scheduled snapshot tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScheduleTick {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

impl ScheduleTick {
    /// Parse raw trigger bytes. An empty payload is a valid tick.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WorkflowError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| WorkflowError::InvalidEvent(format!("not JSON: {}", e)))?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, WorkflowError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Ok(Self {
                id: map.get("id").and_then(Value::as_str).map(str::to_string),
                time: map.get("time").and_then(Value::as_str).map(str::to_string),
            }),
            other => Err(WorkflowError::InvalidEvent(format!(
                "schedule payload must be an object, got {}",
                other
            ))),
        }
    }
}
