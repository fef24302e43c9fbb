pub mod codec;
pub mod error;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod sd;
pub mod subscription;
pub mod transport;

pub use codec::{
    Message, MessageType, ReturnCode, ServiceKey, SomeIpDeserialize, SomeIpHeader, SomeIpSerialize,
};
pub use error::{CodecError, Error, Result};
pub use registry::{AvailabilityHandler, ServiceRegistry};
pub use subscription::{NotifyReport, SubscriptionManager, UnavailablePolicy};
pub use transport::{MemoryNetwork, MemoryTransport, SomeIpTransport, UdpTransport};

pub use sd::{EntryType, RemoteService, RemoteState, SdEntry, SdOption, ServiceDiscovery};
pub use runtime::*;
