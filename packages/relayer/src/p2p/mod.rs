//! Relayer-to-relayer messaging

pub mod antiflood;
pub mod broadcaster;
pub mod message;
pub mod messenger;

pub use broadcaster::{Broadcaster, Outcome};
pub use message::{JoinPayload, MessageSigner, SignaturePayload, SignedMessage};
pub use messenger::{HttpEnvelope, HttpMessenger, InboundMessage, LocalHub, NetMessenger};
