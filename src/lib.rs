//! Off-chain state channel engine.
//!
//! Participants of a channel exchange signed states; the engine keeps them in
//! a [store::SignedStateStore], funds channels directly on chain or out of a
//! ledger channel, and falls back to an on-chain dispute if a counterparty
//! stops cooperating. [engine::Engine] ties the parts together for one
//! participant.

mod abiencode {
    mod error;
    mod hashing;
    mod ser;

    pub mod as_bytes;
    pub mod types;

    pub use error::Error;
    #[cfg(test)]
    pub use hashing::to_bytes;
    pub use hashing::{to_fnargs_hash, to_hash};
    pub use ser::{to_writer, Writer};

    #[cfg(test)]
    pub mod tests;
}
pub mod sig;

pub mod chain;
pub mod challenge;
pub mod channel;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod messages;
pub mod objective;
pub mod store;
pub mod validator;
pub mod wire;

pub use abiencode::types::{Address, Bytes32, Hash, Signature, U256};
pub use abiencode::Error as EncodingError;
pub use config::{EngineConfig, RetryConfig};
pub use engine::{CreateChannelParams, Engine, EngineError};
