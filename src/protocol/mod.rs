//! Message model and at-rest encoding of fit output.
//!
//! ```text
//! worker ──WriterRecord──▶ WriterParser ──WriterMessage──▶ FrameWriter ──▶ fit bytes
//!                                                              │
//!                                   decode / JSON Lines ◀── FrameReader
//! ```

pub mod framing;
pub mod message;
pub mod parser;

pub use framing::{FrameReader, FrameWriter, FramingError, decode_messages, encode_messages};
pub use message::{Feature, FeatureValue, RawValue, Topic, WriterMessage, WriterRecord};
pub use parser::{SamplePhase, WriterParser};
