//! Framed command/event wire protocol (spec.md Section 4.3, Section 6).

pub mod codec;
pub mod command;
pub mod error;
pub mod event;

pub use codec::{encode_frame, FrameDecoder};
pub use command::Command;
pub use error::{ErrorKind, WireError};
pub use event::Event;
