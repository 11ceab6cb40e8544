//! RTP wire format
//!
//! Fixed-header parsing/composition, the payload-type encoding table,
//! and the per-stream validator.

mod encoding;
mod header;
mod validator;

pub use encoding::{Encoding, EncodingMap, PAYLOAD_TYPE_L16_MONO, PAYLOAD_TYPE_L16_STEREO};
pub use header::{compose, parse, RtpHeader, HEADER_SIZE, VERSION};
pub use validator::{Validator, ValidatorConfig};
