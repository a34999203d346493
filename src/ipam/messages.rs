//! IPAM wire envelopes.
//!
//! Flat JSON objects, camelCase keys, unversioned. Optional fields are
//! omitted when unset.

use serde::{Deserialize, Serialize};

/// Operation requested of the IPAM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// Kind of IPAM object an envelope refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Pool,
    Subnet,
    Lease,
}

/// Request envelope published to the IPAM service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamRequest {
    pub name: String,
    pub action: Action,
    pub object_type: ObjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    /// Owning pool id (subnets only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl IpamRequest {
    pub fn create_pool(name: impl Into<String>, metadata: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Action::Create,
            object_type: ObjectType::Pool,
            metadata: Some(metadata.into()),
            pool: None,
            start: None,
            end: None,
        }
    }

    pub fn create_subnet(
        name: impl Into<String>,
        pool_id: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            action: Action::Create,
            object_type: ObjectType::Subnet,
            metadata: None,
            pool: Some(pool_id.into()),
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }
}

/// Reply envelope: the request's shape plus the id the service assigned.
///
/// Only `id` is required; the echoed request fields are optional so a
/// terse reply still decodes. Unknown enum values do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamReply {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<ObjectType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_pool_request_wire_shape() {
        let request = IpamRequest::create_pool("default", "192.168.1.0/24");
        let wire: Value = serde_json::to_value(&request).unwrap();

        assert_eq!(
            wire,
            json!({
                "name": "default",
                "action": "create",
                "objectType": "pool",
                "metadata": "192.168.1.0/24"
            })
        );
    }

    #[test]
    fn test_subnet_request_carries_pool_reference() {
        let request = IpamRequest::create_subnet("default", "P1", "10.0.0.2", "10.0.0.254");
        let wire: Value = serde_json::to_value(&request).unwrap();

        assert_eq!(wire["objectType"], "subnet");
        assert_eq!(wire["pool"], "P1");
        assert_eq!(wire["start"], "10.0.0.2");
        assert_eq!(wire["end"], "10.0.0.254");
        assert!(wire.get("metadata").is_none());
    }

    #[test]
    fn test_reply_decodes_with_echoed_fields() {
        let reply: IpamReply = serde_json::from_str(
            r#"{"id":"S1","name":"default","action":"create","objectType":"subnet","pool":"P1"}"#,
        )
        .unwrap();

        assert_eq!(reply.id, "S1");
        assert_eq!(reply.object_type, Some(ObjectType::Subnet));
        assert_eq!(reply.pool.as_deref(), Some("P1"));
    }

    #[test]
    fn test_reply_without_id_is_rejected() {
        let result: Result<IpamReply, _> = serde_json::from_str(r#"{"name":"default"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result: Result<IpamReply, _> =
            serde_json::from_str(r#"{"id":"P1","action":"rename"}"#);
        assert!(result.is_err());
    }
}
