//! In-memory adjudicator, for tests and local setups.
//!
//! Transactions are mined as soon as they are submitted. Time only moves
//! through [MemoryChain::advance_time].

use super::{AssetHolding, ChainError, ChainService, ChainUpdate, TxHash};
use crate::{
    abiencode::types::{Address, Hash, Signature, U256},
    channel::{challenge_message, AssetOutcome, ChannelId, Destination, Outcome, SignedState},
    sig::recover_signer,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

const FEED_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct OnChainChannel {
    holdings: BTreeMap<Address, U256>,
    turn_num_record: u64,
    finalizes_at: u64,
    finalized: bool,
    /// Outcome of the challenged state.
    outcome: Option<Outcome>,
}

#[derive(Debug, Default)]
struct Inner {
    channels: HashMap<ChannelId, OnChainChannel>,
    feeds: HashMap<ChannelId, Vec<mpsc::Sender<ChainUpdate>>>,
    registrations: HashMap<ChannelId, usize>,
    transactions: HashSet<TxHash>,
    tx_count: u64,
    now: u64,
    failures: VecDeque<ChainError>,
    payouts: HashMap<(Address, Destination), U256>,
}

impl Inner {
    fn take_failure(&mut self) -> Result<(), ChainError> {
        match self.failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn mine(&mut self) -> TxHash {
        self.tx_count += 1;
        let mut tx = [0u8; 32];
        tx[24..].copy_from_slice(&self.tx_count.to_be_bytes());
        let tx = Hash(tx);
        self.transactions.insert(tx);
        tx
    }

    fn snapshot(&self, channel_id: ChannelId) -> ChainUpdate {
        let ch = self.channels.get(&channel_id);
        ChainUpdate {
            channel_id,
            holdings: ch
                .map(|c| {
                    c.holdings
                        .iter()
                        .map(|(asset_holder, amount)| AssetHolding {
                            asset_holder: *asset_holder,
                            amount: *amount,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            turn_num_record: ch.map_or(0, |c| c.turn_num_record),
            finalizes_at: ch.map_or(0, |c| c.finalizes_at),
            finalized: ch.map_or(false, |c| c.finalized),
            block_timestamp: self.now,
        }
    }

    fn notify(&mut self, channel_id: ChannelId) {
        let update = self.snapshot(channel_id);
        if let Some(feeds) = self.feeds.get_mut(&channel_id) {
            feeds.retain(|feed| match feed.try_send(update.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(channel_id = ?channel_id, "chain feed is full, dropping update");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryChain {
    inner: Mutex<Inner>,
}

fn reverted(reason: impl Into<String>) -> ChainError {
    ChainError::Reverted(reason.into())
}

fn check_supported(signed: &SignedState) -> Result<(), ChainError> {
    match signed.is_supported() {
        Ok(true) => Ok(()),
        Ok(false) => Err(reverted("state is not signed by every participant")),
        Err(e) => Err(reverted(e.to_string())),
    }
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.inner.lock().now
    }

    /// Moves the clock forward, finalizing channels whose challenge expired.
    pub fn advance_time(&self, seconds: u64) {
        let mut inner = self.inner.lock();
        inner.now += seconds;
        let now = inner.now;
        let expired: Vec<ChannelId> = inner
            .channels
            .iter_mut()
            .filter(|(_, c)| c.finalizes_at > 0 && !c.finalized && c.finalizes_at <= now)
            .map(|(id, c)| {
                c.finalized = true;
                *id
            })
            .collect();
        for id in expired {
            info!(channel_id = ?id, "challenge timed out, channel finalized");
            inner.notify(id);
        }
    }

    /// Makes the next submission fail with `error`.
    pub fn fail_next(&self, error: ChainError) {
        self.inner.lock().failures.push_back(error);
    }

    pub fn status(&self, channel_id: ChannelId) -> ChainUpdate {
        self.inner.lock().snapshot(channel_id)
    }

    /// Number of outstanding registrations of the channel.
    pub fn registrations(&self, channel_id: ChannelId) -> usize {
        self.inner
            .lock()
            .registrations
            .get(&channel_id)
            .copied()
            .unwrap_or_default()
    }

    /// Total paid out of `asset_holder` to `destination`.
    pub fn payout(&self, asset_holder: Address, destination: Destination) -> U256 {
        self.inner
            .lock()
            .payouts
            .get(&(asset_holder, destination))
            .copied()
            .unwrap_or_default()
    }

    /// Answers a registered challenge with a newer supported state.
    pub fn respond(&self, signed: SignedState) -> Result<TxHash, ChainError> {
        check_supported(&signed)?;
        let id = signed.state.channel_id();
        let mut inner = self.inner.lock();
        inner.take_failure()?;
        {
            let ch = inner.channels.entry(id).or_default();
            if ch.finalized || ch.finalizes_at == 0 {
                return Err(reverted("no challenge to respond to"));
            }
            if signed.state.turn_num <= ch.turn_num_record {
                return Err(reverted("response is not newer than the challenge"));
            }
            ch.turn_num_record = signed.state.turn_num;
            ch.finalizes_at = 0;
            ch.outcome = Some(signed.state.outcome.clone());
        }
        debug!(channel_id = ?id, turn_num = signed.state.turn_num, "challenge answered");
        let tx = inner.mine();
        inner.notify(id);
        Ok(tx)
    }
}

#[async_trait]
impl ChainService for MemoryChain {
    async fn fund_channel(
        &self,
        channel_id: ChannelId,
        asset_holder: Address,
        expected_held: U256,
        amount: U256,
    ) -> Result<TxHash, ChainError> {
        let mut inner = self.inner.lock();
        inner.take_failure()?;
        {
            let ch = inner.channels.entry(channel_id).or_default();
            if ch.finalized {
                return Err(reverted("channel is finalized"));
            }
            let held = ch.holdings.entry(asset_holder).or_default();
            if *held < expected_held {
                return Err(reverted(format!(
                    "holdings {} are below the expected {}",
                    held, expected_held
                )));
            }
            let target = expected_held
                .checked_add(amount)
                .ok_or_else(|| reverted("deposit overflows"))?;
            if *held < target {
                *held = target;
            }
        }
        debug!(channel_id = ?channel_id, %amount, "deposit");
        let tx = inner.mine();
        inner.notify(channel_id);
        Ok(tx)
    }

    async fn challenge(
        &self,
        candidate: SignedState,
        challenger_signature: Signature,
    ) -> Result<TxHash, ChainError> {
        check_supported(&candidate)?;
        let constants = candidate.state.constants.clone();
        let id = constants.id();
        let turn = candidate.state.turn_num;
        let msg = challenge_message(id, turn).map_err(|e| reverted(e.to_string()))?;
        let challenger =
            recover_signer(msg, &challenger_signature).map_err(|e| reverted(e.to_string()))?;
        if constants.index_of(challenger).is_none() {
            return Err(reverted("challenger is not a participant"));
        }

        let mut inner = self.inner.lock();
        inner.take_failure()?;
        let now = inner.now;
        {
            let ch = inner.channels.entry(id).or_default();
            if ch.finalized {
                return Err(reverted("channel is finalized"));
            }
            if ch.finalizes_at > 0 && turn <= ch.turn_num_record {
                return Err(reverted("a challenge is already registered"));
            }
            if turn < ch.turn_num_record {
                return Err(reverted("candidate is older than the turn record"));
            }
            ch.turn_num_record = turn;
            ch.finalizes_at = now + constants.challenge_duration();
            ch.outcome = Some(candidate.state.outcome.clone());
        }
        info!(channel_id = ?id, turn_num = turn, "challenge registered");
        let tx = inner.mine();
        inner.notify(id);
        Ok(tx)
    }

    async fn conclude_and_withdraw(&self, proof: SignedState) -> Result<TxHash, ChainError> {
        check_supported(&proof)?;
        let id = proof.state.channel_id();
        let mut inner = self.inner.lock();
        inner.take_failure()?;
        let mut paid = Vec::new();
        {
            let ch = inner.channels.entry(id).or_default();
            let outcome = if proof.state.is_final {
                proof.state.outcome.clone()
            } else if ch.finalized && proof.state.turn_num == ch.turn_num_record {
                ch.outcome.clone().unwrap_or_default()
            } else {
                return Err(reverted("proof does not finalize the channel"));
            };
            for asset in &outcome.0 {
                if let AssetOutcome::Allocation {
                    asset_holder,
                    items,
                } = asset
                {
                    let remaining = ch.holdings.entry(*asset_holder).or_default();
                    for item in items {
                        let pay = item.amount.min(*remaining);
                        *remaining -= pay;
                        if !pay.is_zero() {
                            paid.push(((*asset_holder, item.destination), pay));
                        }
                    }
                }
            }
            ch.finalized = true;
            ch.finalizes_at = 0;
            ch.turn_num_record = ch.turn_num_record.max(proof.state.turn_num);
        }
        for (key, amount) in paid {
            *inner.payouts.entry(key).or_default() += amount;
        }
        info!(channel_id = ?id, "channel concluded");
        let tx = inner.mine();
        inner.notify(id);
        Ok(tx)
    }

    async fn wait_for_transaction(&self, tx: TxHash) -> Result<(), ChainError> {
        if self.inner.lock().transactions.contains(&tx) {
            Ok(())
        } else {
            Err(ChainError::UnknownTransaction(tx))
        }
    }

    async fn register_channel(&self, channel_id: ChannelId) -> Result<(), ChainError> {
        let mut inner = self.inner.lock();
        inner.channels.entry(channel_id).or_default();
        *inner.registrations.entry(channel_id).or_default() += 1;
        Ok(())
    }

    async fn unregister_channel(&self, channel_id: ChannelId) -> Result<(), ChainError> {
        let mut inner = self.inner.lock();
        let remaining = match inner.registrations.get_mut(&channel_id) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return Err(ChainError::UnknownChannel(channel_id)),
        };
        if remaining == 0 {
            inner.registrations.remove(&channel_id);
            // Dropping the senders ends the feeds.
            inner.feeds.remove(&channel_id);
        }
        Ok(())
    }

    async fn chain_updated_feed(
        &self,
        channel_id: ChannelId,
    ) -> Result<mpsc::Receiver<ChainUpdate>, ChainError> {
        let mut inner = self.inner.lock();
        if !inner.channels.contains_key(&channel_id) {
            return Err(ChainError::UnknownChannel(channel_id));
        }
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let _ = tx.try_send(inner.snapshot(channel_id));
        inner.feeds.entry(channel_id).or_default().push(tx);
        Ok(rx)
    }
}
