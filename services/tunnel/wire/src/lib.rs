//! Frame headers, typed payloads and length-prefixed codec for the tunnel admin.
//!
//! Every frame exchanged with an agent carries a routing header naming the
//! sender, the accepter and the hop path between them, followed by a typed
//! payload. Encryption and signing of the payload are not handled here.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+------------------------------+
//! | u32 frame_len        | length of bytes that follow  |
//! +----------------------+------------------------------+
//! | u16 + sender         | sender UUID                  |
//! +----------------------+------------------------------+
//! | u16 + accepter       | accepter UUID                |
//! +----------------------+------------------------------+
//! | u16 message_type     | payload discriminant         |
//! +----------------------+------------------------------+
//! | u32 route_len        | length of the route string   |
//! +----------------------+------------------------------+
//! | route                | ':'-separated hop UUIDs      |
//! +----------------------+------------------------------+
//! | payload              | message specific             |
//! +----------------------+------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod sink;

pub use error::WireError;
pub use frame::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use header::{Header, MessageType, ADMIN_UUID, MAX_ROUTE_LEN};
pub use message::{KeepMsg, Message};
pub use sink::FrameSink;
