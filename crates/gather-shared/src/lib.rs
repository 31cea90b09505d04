// Types, wire protocol, and constants shared by the Gather chat client and relay.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ProtocolError, ValidationError};
pub use protocol::{ClientFrame, Message, SendAck, ServerFrame};
pub use types::{MessageId, UserIdentity, UserProfile};
