//! Sync channel messages
//!
//! The y-protocols sync encoding (lib0 var-ints), via `yrs::sync`:
//!
//! ```text
//! varUint(type) varUint8Array(payload)
//!
//! type 0  step 1  payload = state vector of the sender
//! type 1  step 2  payload = update the receiver is missing
//! type 2  update  payload = incremental update
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::MAX_MESSAGE_SIZE;
use yrs::encoding::read::{Cursor, Read};
use yrs::sync::protocol::MSG_SYNC_STEP_1;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

pub use yrs::sync::SyncMessage;

/// Decode a sync channel payload.
///
/// A step 1 whose state vector cannot be read is treated as an empty state
/// vector, so the answer carries the full document.
pub fn decode_sync(bytes: &[u8]) -> ProtocolResult<SyncMessage> {
    if bytes.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    SyncMessage::decode_v1(bytes).or_else(|e| {
        let mut cursor = Cursor::new(bytes);
        match cursor.read_var::<u8>() {
            Ok(MSG_SYNC_STEP_1) if cursor.read_buf().is_ok() => {
                Ok(SyncMessage::SyncStep1(StateVector::default()))
            }
            _ => Err(e.into()),
        }
    })
}

pub fn encode_sync(message: &SyncMessage) -> Vec<u8> {
    message.encode_v1()
}

/// Short name for logs and metric labels
pub fn sync_kind(message: &SyncMessage) -> &'static str {
    match message {
        SyncMessage::SyncStep1(_) => "step1",
        SyncMessage::SyncStep2(_) => "step2",
        SyncMessage::Update(_) => "update",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        // Matches what a y-protocols client puts on the wire
        let encoded = encode_sync(&SyncMessage::Update(vec![9, 8, 7]));
        assert_eq!(encoded, vec![2, 3, 9, 8, 7]);

        let step1 = decode_sync(&[0, 1, 0]).unwrap();
        assert_eq!(step1, SyncMessage::SyncStep1(StateVector::default()));
        assert_eq!(sync_kind(&step1), "step1");
    }

    #[test]
    fn test_decode_each_type() {
        let mut sv = StateVector::default();
        sv.set_max(7, 3);
        for msg in [
            SyncMessage::SyncStep1(sv),
            SyncMessage::SyncStep2(vec![3]),
            SyncMessage::Update(vec![]),
        ] {
            assert_eq!(decode_sync(&encode_sync(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn test_unreadable_state_vector_asks_for_everything() {
        // Step 1 whose 2 byte state vector claims 255 entries
        let msg = decode_sync(&[0, 2, 0xff, 0x01]).unwrap();
        assert_eq!(msg, SyncMessage::SyncStep1(StateVector::default()));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode_sync(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(decode_sync(&[7, 0]), Err(ProtocolError::Decode(_))));
        // Declares a 5 byte payload but carries 1
        assert!(matches!(decode_sync(&[2, 5, 1]), Err(ProtocolError::Decode(_))));
        assert!(matches!(decode_sync(&[0, 5, 1]), Err(ProtocolError::Decode(_))));
    }
}
