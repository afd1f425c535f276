//! Channel framing for multiplexed transports
//!
//! Binary frames use the y-websocket layout, so stock Yjs clients can talk to
//! the server:
//!
//! ```text
//! varUint(0) <sync message>
//! varUint(1) varUint8Array(<awareness update>)
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;
use yrs::sync::protocol::{MSG_AWARENESS, MSG_SYNC};

/// Maximum frame size (16MB update plus framing)
pub const MAX_MESSAGE_SIZE: usize = coedit_core::document::MAX_UPDATE_SIZE + 64;

/// Logical channel a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Document content (sync step 1 / step 2 / update)
    Sync,
    /// Ephemeral presence
    Awareness,
}

impl Channel {
    pub fn tag(self) -> u8 {
        match self {
            Channel::Sync => MSG_SYNC,
            Channel::Awareness => MSG_AWARENESS,
        }
    }

    pub fn from_tag(tag: u8) -> ProtocolResult<Self> {
        match tag {
            MSG_SYNC => Ok(Channel::Sync),
            MSG_AWARENESS => Ok(Channel::Awareness),
            other => Err(ProtocolError::UnknownChannel(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Sync => "sync",
            Channel::Awareness => "awareness",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Prefix `payload` with its channel tag. Awareness payloads are also length
/// prefixed.
pub fn encode_frame(channel: Channel, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(payload.len() + 6);
    buf.write_var(channel.tag());
    match channel {
        Channel::Sync => buf.extend_from_slice(payload),
        Channel::Awareness => buf.write_buf(payload),
    }
    Bytes::from(buf)
}

/// Split a frame into its channel and the channel payload
pub fn decode_frame(frame: &[u8]) -> ProtocolResult<(Channel, &[u8])> {
    if frame.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: frame.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut cursor = Cursor::new(frame);
    let channel = Channel::from_tag(cursor.read_var()?)?;
    let payload = match channel {
        Channel::Sync => &frame[cursor.next..],
        Channel::Awareness => {
            let len = cursor.read_buf()?.len();
            &frame[cursor.next - len..cursor.next]
        }
    };
    Ok((channel, payload))
}
