//! hpcsh-core: Shared protocol library for the HPC terminal bridge.
//!
//! Provides the CBOR message types exchanged between the session gateway
//! and remote clients, the codec, the error taxonomy, and session-id
//! generation.

pub mod codec;
pub mod error;
pub mod id;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_message, encode_message, MAX_MESSAGE_SIZE};
pub use error::{HpcshError, HpcshResult};
pub use id::generate_session_id;
pub use messages::{
    AllocRequest, ClientMessage, ErrorCode, ServerMessage, SessionInfo, SessionState,
};
