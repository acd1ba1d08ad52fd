//! Contract of the on-chain adjudicator as seen by the engine.

pub mod memory;

use crate::{
    abiencode::types::{Address, Hash, Signature, U256},
    channel::{ChannelId, SignedState},
};
use async_trait::async_trait;
use core::fmt::Debug;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryChain;

pub type TxHash = Hash;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Network or gas trouble, submitting again may succeed.
    #[error("transient chain failure: {0}")]
    Transient(String),
    /// The adjudicator rejected the call, resubmitting will not help.
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("unknown transaction {0}")]
    UnknownTransaction(TxHash),
    #[error("channel {0} is not known to the chain service")]
    UnknownChannel(ChannelId),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHolding {
    pub asset_holder: Address,
    pub amount: U256,
}

/// Snapshot of a channel's on-chain status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUpdate {
    pub channel_id: ChannelId,
    pub holdings: Vec<AssetHolding>,
    pub turn_num_record: u64,
    /// Zero while no challenge is registered.
    pub finalizes_at: u64,
    pub finalized: bool,
    pub block_timestamp: u64,
}

impl ChainUpdate {
    pub fn holding(&self, asset_holder: Address) -> U256 {
        self.holdings
            .iter()
            .find(|h| h.asset_holder == asset_holder)
            .map(|h| h.amount)
            .unwrap_or_default()
    }

    pub fn challenge_registered(&self) -> bool {
        self.finalizes_at > 0 && !self.finalized
    }
}

#[async_trait]
pub trait ChainService: Debug + Send + Sync {
    /// Deposits `amount` unless the holdings already cover
    /// `expected_held + amount`. Reverts if they are below `expected_held`.
    async fn fund_channel(
        &self,
        channel_id: ChannelId,
        asset_holder: Address,
        expected_held: U256,
        amount: U256,
    ) -> Result<TxHash, ChainError>;

    /// Registers a challenge with `candidate` as the latest state.
    /// `challenger_signature` authorizes it, see
    /// [crate::channel::challenge_message].
    async fn challenge(
        &self,
        candidate: SignedState,
        challenger_signature: Signature,
    ) -> Result<TxHash, ChainError>;

    /// Finalizes the channel with a supported final state (or the state of a
    /// timed out challenge) and pays out its outcome.
    async fn conclude_and_withdraw(&self, proof: SignedState) -> Result<TxHash, ChainError>;

    async fn wait_for_transaction(&self, tx: TxHash) -> Result<(), ChainError>;

    /// Starts watching the channel. Registrations are counted, every
    /// `register_channel` is matched by one `unregister_channel`.
    async fn register_channel(&self, channel_id: ChannelId) -> Result<(), ChainError>;

    /// Drops one registration. Feeds of the channel end with the last one.
    async fn unregister_channel(&self, channel_id: ChannelId) -> Result<(), ChainError>;

    /// Stream of status updates for a registered channel, starting with the
    /// current one.
    async fn chain_updated_feed(
        &self,
        channel_id: ChannelId,
    ) -> Result<mpsc::Receiver<ChainUpdate>, ChainError>;
}
