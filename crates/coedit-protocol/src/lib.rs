//! coedit wire protocol
//!
//! Binary frames carry y-protocols compatible payloads on two channels:
//! ```text
//! varUint(0) <sync message>                      # step1 / step2 / update
//! varUint(1) varUint8Array(<awareness update>)   # presence
//! ```
//! Text frames carry JSON control messages (`join`, `leave`, `peer_joined`, ...).

pub mod control;
pub mod error;
pub mod frame;
pub mod sync;

pub use control::{ClientControl, ServerControl, UserInfo};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{decode_frame, encode_frame, Channel};
pub use sync::{decode_sync, encode_sync, sync_kind, SyncMessage};
