use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Name of a node. Doubles as the originator id of the records it owns and
/// as the tie-breaker in spanning-tree parent selection.
#[derive(
    Clone,
    Debug,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    PartialOrd,
    Ord,
    Eq,
    Hash,
    Encode,
    Decode,
)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn value(&self) -> &str {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for NodeName {
    fn from(id: &str) -> Self {
        NodeName::new(id.to_string())
    }
}

impl From<String> for NodeName {
    fn from(id: String) -> Self {
        NodeName::new(id)
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_ordering_and_display() {
        let a = NodeName::from("node-a");
        let b = NodeName::from("node-b".to_string());
        assert!(a < b);
        assert_eq!(a.to_string(), "node-a");
        assert_eq!(a.as_str(), a.value());
    }

    #[test]
    fn test_node_name_serializes_as_string() {
        let name = NodeName::from("node1");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"node1\"");
    }
}
