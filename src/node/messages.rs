//! Request and response bodies shared by the node, the HTTP API and the admin client
use serde::{Deserialize, Serialize};

use crate::flood::engine::FloodCounters;
use crate::kvstore::filter::KvFilter;
use crate::kvstore::record::KeyVals;
use crate::kvstore::store::StoreCounters;
use crate::node::NodeName;
use crate::subscription::SubscriptionCounters;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaSummary {
    pub area: String,
    pub key_count: usize,
    pub peer_count: usize,
    pub local_key_count: usize,
    pub subscriber_count: usize,
    pub store: StoreCounters,
    pub flood: FloodCounters,
    pub subscriptions: SubscriptionCounters,
}

/// How many records of a `set_key_vals` batch were taken
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub accepted: usize,
    pub rejected: usize,
    pub no_op: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetKeyValsRequest {
    pub key_vals: KeyVals,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLocalKeyRequest {
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetKeysRequest {
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub filter: KvFilter,
    /// Areas to subscribe to; all areas when empty
    #[serde(default)]
    pub areas: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeerRequest {
    pub name: NodeName,
    pub addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsetLocalKeyResponse {
    pub key: String,
    pub was_local: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelPeerResponse {
    pub name: NodeName,
    pub removed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::filter::FilterOperator;

    #[test]
    fn test_subscribe_request_defaults() {
        let request: SubscribeRequest = serde_json::from_str("{}").unwrap();
        assert!(request.areas.is_empty());
        assert_eq!(request.filter.oper, FilterOperator::Or);
        assert!(request.filter.keys.is_empty());
    }

    #[test]
    fn test_add_peer_request_json() {
        let request: AddPeerRequest =
            serde_json::from_str(r#"{"name": "node2", "addr": "10.0.0.2:8411"}"#).unwrap();
        assert_eq!(request.name.as_str(), "node2");
        assert_eq!(request.addr, "10.0.0.2:8411");
    }
}
