//! The fixed set of replicated collections.
//!
//! Every component refers to collections through [`CollectionName`]; raw
//! strings only appear at the edges (HTTP paths, peer messages) and are
//! parsed back with [`CollectionName::parse`].

use serde::{Deserialize, Serialize};

/// Collections kept in the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionName {
    Asset,
    #[serde(rename = "ERPMasterData")]
    ErpMasterData,
    Issue,
    Plant,
    User,
}

impl CollectionName {
    /// All collections, in declaration order.
    pub const ALL: [CollectionName; 5] = [
        CollectionName::Asset,
        CollectionName::ErpMasterData,
        CollectionName::Issue,
        CollectionName::Plant,
        CollectionName::User,
    ];

    /// Returns the collection identifier as used in queries and by the remote API.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionName::Asset => "Asset",
            CollectionName::ErpMasterData => "ERPMasterData",
            CollectionName::Issue => "Issue",
            CollectionName::Plant => "Plant",
            CollectionName::User => "User",
        }
    }

    /// Parse from the collection identifier. Matching is exact.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Query used for the collection-wide live subscription.
    pub fn subscription_query(&self) -> String {
        format!("SELECT * FROM {}", self.as_str())
    }
}

impl std::fmt::Display for CollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrips_every_collection() {
        for collection in CollectionName::ALL {
            assert_eq!(CollectionName::parse(collection.as_str()), Some(collection));
        }
    }

    #[test]
    fn test_parse_rejects_unknown_and_wrong_case() {
        assert_eq!(CollectionName::parse("Vehicle"), None);
        assert_eq!(CollectionName::parse("asset"), None);
        assert_eq!(CollectionName::parse(""), None);
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&CollectionName::ErpMasterData).unwrap();
        assert_eq!(json, "\"ERPMasterData\"");

        let parsed: CollectionName = serde_json::from_str("\"Plant\"").unwrap();
        assert_eq!(parsed, CollectionName::Plant);
    }

    #[test]
    fn test_subscription_query() {
        assert_eq!(
            CollectionName::Issue.subscription_query(),
            "SELECT * FROM Issue"
        );
    }
}
