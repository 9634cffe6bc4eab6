//! Wire protocol: JSON envelopes, the text-frame codec, payload validation,
//! and per-session job numbering.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{
    decode_client_message, decode_payload, decode_server_message, encode_client_message,
    encode_server_message, encode_video, validate_process, CodecError, DecodedInput, PayloadKind,
    PayloadLimits,
};
pub use messages::*;
pub use sequence::JobCounter;
