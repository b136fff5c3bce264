pub mod codec;
pub mod event;

pub use codec::{decode_event, encode_event, CodecError};
pub use event::{now_ns, Event, Field, FieldValue, DEFAULT_SEVERITY};
