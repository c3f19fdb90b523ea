//! Chat Protocol
//!
//! Line framing and the text formats exchanged between relay and clients.

pub mod codec;
pub mod constants;
pub mod messages;

pub use codec::{
    message_reader, message_writer, read_message, LenientLinesCodec, LenientMessageReader,
    MessageReader, MessageWriter,
};
pub use constants::*;
pub use messages::*;
