//! # Message Codec
//!
//! Encodes and decodes messages to and from the wire format.
//!
//! ## Key Types
//!
//! - [`SomeIpHeader`] - 18-byte header (service, instance, method, length,
//!   request ID, versions, type, code)
//! - [`Message`] - immutable header + payload, built via [`MessageBuilder`]
//!   or [`Message::response_to`]
//! - [`MessageType`] / [`ReturnCode`] - typed header bytes
//! - [`SessionIdManager`] - session ID generation
//! - [`SomeIpSerialize`] / [`SomeIpDeserialize`] - fixed-layout wire structures (used by SD)
//!
//! ## Example
//!
//! ```
//! use someip_middleware::codec::{self, Message, ServiceKey};
//!
//! let key = ServiceKey::new(0x1234, 0x5678);
//! let request = Message::request(key, 0x0421)
//!     .client_id(1)
//!     .session_id(1)
//!     .payload(vec![0u8, 1, 2])
//!     .build();
//! let bytes = codec::encode(&request);
//! assert_eq!(codec::decode(&bytes).unwrap(), request);
//! ```

pub mod header;
pub mod message;
pub mod session;
pub mod traits;

pub use header::{MessageType, ReturnCode, SomeIpHeader};
pub use message::{decode, decode_all, encode, Decoded, Message, MessageBuilder, ServiceKey};
pub use session::SessionIdManager;
pub use traits::{SomeIpDeserialize, SomeIpSerialize};

mod tests;
