//! Message model and wire encoding.
//!
//! A frame is a 16-byte header followed by either a table of typed fields
//! or a raw byte payload, padded to an 8-byte boundary:
//!
//! ```text
//! +------+-------+------+----+-----------------+----------------------+
//! | code | flags | size | id | count / length  | fields | payload ... |
//! |  u16 |  u16  |  u32 | u32|       u32       |                      |
//! +------+-------+------+----+-----------------+----------------------+
//! ```
//!
//! All integers are big-endian. `size` covers the whole frame including
//! the header and padding.

pub mod codes;
mod field;
mod message;

pub use field::{Field, FieldValue};
pub use message::{FrameHeader, Message, MessageBody, HEADER_SIZE};
