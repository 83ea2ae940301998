//! Node and operation identities

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a cluster member.
///
/// Cheap to clone, ordered and hashable so it can key membership sets and
/// response maps. Serialized on the wire as a UTF string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one client-submitted operation within a session.
///
/// Assigned at submission time; travels with the request so the reply can be
/// routed back to the original submitter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from its wire (string) form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::Wire(format!("invalid operation id: {}", e)))
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering() {
        let a = NodeId::from("node-a");
        let b = NodeId::from("node-b");
        assert!(a < b);
        assert_eq!(a, NodeId::new("node-a"));
    }

    #[test]
    fn test_operation_id_roundtrip() {
        let id = OperationId::new();
        let parsed = OperationId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_operation_id_unique() {
        assert_ne!(OperationId::new(), OperationId::new());
    }
}
