//! Wire layer shared by connections and the broker.
//!
//! - **Protocol**: envelope types (call, update, result, register, cancel)
//! - **Codec**: 4-byte little-endian length prefix + UTF-8 JSON payload

pub mod codec;
pub mod protocol;

pub use codec::{decode_payload, encode_frame, read_envelope, read_frame, write_envelope};
pub use protocol::{new_context_id, Call, Cancel, Envelope, HandlerId, Register, Response, Update};
