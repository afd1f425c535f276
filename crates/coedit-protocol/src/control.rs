//! JSON control messages exchanged outside the binary channels

use crate::error::ProtocolResult;
use coedit_core::{ConnectionId, DocumentId};
use serde::{Deserialize, Serialize};

/// Identity a connection presents when joining, already authorized upstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl UserInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Requests a client sends as text frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    Join {
        document_id: DocumentId,
        #[serde(default)]
        user: UserInfo,
    },
    Leave,
}

impl ClientControl {
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Notifications the server sends as text frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerControl {
    Joined {
        document_id: DocumentId,
        connection_id: ConnectionId,
        member_count: usize,
    },
    PeerJoined {
        document_id: DocumentId,
        connection_id: ConnectionId,
        user: UserInfo,
        member_count: usize,
    },
    PeerLeft {
        document_id: DocumentId,
        connection_id: ConnectionId,
        member_count: usize,
    },
    Left {
        document_id: DocumentId,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerControl {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerControl::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
