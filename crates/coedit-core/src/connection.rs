//! Connection identifiers

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Opaque identifier of one client connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidConnectionId("Connection ID cannot be empty".into()));
        }
        Ok(Self(id))
    }

    /// Random connection ID with the given prefix, e.g. `ws:3f1c...`
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}:{}", prefix, uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
