//! RCT Power serial protocol over TCP
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   Discovery / Scheduler (one request at a    │
//! │   time, correlation by object identifier)    │
//! └──────────────────────────────────────────────┘
//!                       │ Frame
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │   RctCodec: escaping, CRC, resynchronisation │
//! └──────────────────────────────────────────────┘
//!                       │ bytes
//!                       ▼
//!                   TcpStream
//! ```

pub mod codec;
pub mod command;
pub mod value;

pub use codec::{
    checksum, encode_request, DecodeError, DecodeErrorKind, DecodeEvent, Frame, RctCodec,
    ESCAPE_BYTE, START_BYTE,
};
pub use command::Command;
pub use value::{DataKind, Value};
