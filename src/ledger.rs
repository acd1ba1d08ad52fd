//! Ledger Consensus Protocol: turns queued funding requests into
//! propose/vote rounds on a ledger channel.
//!
//! All participants of a ledger channel crank it whenever its history
//! changes. Whoever's turn it is either proposes the next request, votes on
//! (or vetoes) the open proposal, or countersigns a settled state so that it
//! becomes supported.

pub mod queue;

use crate::{
    abiencode::types::{Address, U256},
    channel::{AllocationItem, AssetOutcome, ChannelConstants, ChannelError, ChannelId, Outcome, PartIdx, SignedState},
    sig::Signer,
    store::{SignedStateStore, StoreError},
    validator::{consensus, AppRules, ConsensusData, TransitionError},
    wire::ConversionError,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use queue::{RequestQueue, SchedulingPolicy};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger channel {0} is unknown")]
    UnknownLedger(ChannelId),
    #[error("channel {0} does not run the consensus app")]
    NotALedger(ChannelId),
    #[error("we are not a participant of ledger channel {0}")]
    NotAParticipant(ChannelId),
    #[error("participant {participant} has {available} in the ledger, {required} is required")]
    InsufficientFunds {
        participant: PartIdx,
        available: U256,
        required: U256,
    },
    #[error("channel {0} is already funded by the ledger")]
    AlreadyFunded(ChannelId),
    #[error("channel {0} is not funded by the ledger")]
    NotFunded(ChannelId),
    #[error("request has {got} amounts, the ledger has {expected} participants")]
    AmountCount { expected: usize, got: usize },
    #[error("ledger holds {held} for the channel, the request returns {requested}")]
    AmountMismatch { held: U256, requested: U256 },
    #[error("ledger request for channel {0} does not match the agreed amounts")]
    ConflictingRequest(ChannelId),
    #[error("amount overflow")]
    Overflow,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("invalid ledger app data: {0}")]
    AppData(#[from] ConversionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestKind {
    Fund,
    Defund,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Queued,
    /// Included in a proposal that is not agreed yet.
    Pending,
    Succeeded,
    Cancelled(String),
}

impl RequestStatus {
    pub fn is_outstanding(&self) -> bool {
        matches!(self, RequestStatus::Queued | RequestStatus::Pending)
    }
}

/// At most one request exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey {
    pub ledger_channel_id: ChannelId,
    pub channel_to_be_funded: ChannelId,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRequest {
    pub ledger_channel_id: ChannelId,
    pub kind: RequestKind,
    pub channel_to_be_funded: ChannelId,
    pub asset_holder: Address,
    /// What each ledger participant (by index) contributes to, or gets back
    /// from, the funded channel.
    pub amounts: Vec<U256>,
    pub status: RequestStatus,
    pub missed_opportunity_count: u32,
    pub last_seen_agreed_turn: Option<u64>,
    /// Set when a proposal of this request was vetoed. The request is not
    /// proposed again until a peer announces it.
    pub vetoed: bool,
    /// The ledger outcome we proposed or voted for on behalf of this request.
    pub proposed_outcome: Option<Outcome>,
    /// Arrival order, assigned by the queue.
    pub created_seq: u64,
}

impl LedgerRequest {
    pub fn new(
        ledger_channel_id: ChannelId,
        kind: RequestKind,
        channel_to_be_funded: ChannelId,
        asset_holder: Address,
        amounts: Vec<U256>,
    ) -> Self {
        Self {
            ledger_channel_id,
            kind,
            channel_to_be_funded,
            asset_holder,
            amounts,
            status: RequestStatus::Queued,
            missed_opportunity_count: 0,
            last_seen_agreed_turn: None,
            vetoed: false,
            proposed_outcome: None,
            created_seq: 0,
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            ledger_channel_id: self.ledger_channel_id,
            channel_to_be_funded: self.channel_to_be_funded,
            kind: self.kind,
        }
    }

    pub fn total(&self) -> Option<U256> {
        self.amounts
            .iter()
            .try_fold(U256::zero(), |acc, a| acc.checked_add(*a))
    }

    /// Whether both ask for the same funds to move.
    pub fn same_terms(&self, other: &LedgerRequest) -> bool {
        self.key() == other.key()
            && self.asset_holder == other.asset_holder
            && self.amounts == other.amounts
    }

    /// Whether `outcome` is the ledger outcome this request was proposed or
    /// voted for: the target item is in place and every participant was
    /// debited or credited its amount.
    pub fn is_applied(&self, outcome: &Outcome) -> bool {
        let target = self.channel_to_be_funded;
        let items = outcome.items_for(self.asset_holder).unwrap_or(&[]);
        let held = items.iter().find(|i| i.destination == target);
        let target_done = match self.kind {
            RequestKind::Fund => held.map(|i| i.amount) == self.total(),
            RequestKind::Defund => held.is_none(),
        };
        target_done && self.proposed_outcome.as_ref() == Some(outcome)
    }

    /// The ledger outcome after servicing this request.
    pub fn apply(&self, outcome: &Outcome, ledger: &ChannelConstants) -> Result<Outcome, LedgerError> {
        let n = ledger.num_participants();
        if self.amounts.len() != n {
            return Err(LedgerError::AmountCount {
                expected: n,
                got: self.amounts.len(),
            });
        }
        let total = self.total().ok_or(LedgerError::Overflow)?;
        let target = self.channel_to_be_funded;

        let mut next = outcome.clone();
        if next.items_for(self.asset_holder).is_none() {
            next.0.push(AssetOutcome::Allocation {
                asset_holder: self.asset_holder,
                items: Vec::new(),
            });
        }
        let items = next
            .items_for_mut(self.asset_holder)
            .ok_or(LedgerError::NotFunded(target))?;

        match self.kind {
            RequestKind::Fund => {
                if items.iter().any(|i| i.destination == target) {
                    return Err(LedgerError::AlreadyFunded(target));
                }
                for (idx, (p, amount)) in ledger.participants().iter().zip(&self.amounts).enumerate() {
                    if amount.is_zero() {
                        continue;
                    }
                    let item = items.iter_mut().find(|i| i.destination == p.destination);
                    match item {
                        Some(item) if item.amount >= *amount => item.amount -= *amount,
                        other => {
                            return Err(LedgerError::InsufficientFunds {
                                participant: idx,
                                available: other.map(|i| i.amount).unwrap_or_default(),
                                required: *amount,
                            })
                        }
                    }
                }
                items.push(AllocationItem::new(target, total));
            }
            RequestKind::Defund => {
                let pos = items
                    .iter()
                    .position(|i| i.destination == target)
                    .ok_or(LedgerError::NotFunded(target))?;
                let held = items[pos].amount;
                if held != total {
                    return Err(LedgerError::AmountMismatch {
                        held,
                        requested: total,
                    });
                }
                items.remove(pos);
                for (p, amount) in ledger.participants().iter().zip(&self.amounts) {
                    match items.iter_mut().find(|i| i.destination == p.destination) {
                        Some(item) => {
                            item.amount = item.amount.checked_add(*amount).ok_or(LedgerError::Overflow)?
                        }
                        None => items.push(AllocationItem::new(p.destination, *amount)),
                    }
                }
            }
        }
        Ok(next)
    }
}

/// Runs the ledger protocol for every ledger channel this engine is part of.
#[derive(Debug)]
pub struct LedgerFunder {
    queue: Mutex<RequestQueue>,
}

impl LedgerFunder {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self {
            queue: Mutex::new(RequestQueue::new(policy)),
        }
    }

    /// Returns whether the request was new or became eligible again.
    pub fn enqueue(&self, request: LedgerRequest) -> bool {
        self.queue.lock().upsert(request)
    }

    pub fn request(&self, key: &RequestKey) -> Option<LedgerRequest> {
        self.queue.lock().get(key).cloned()
    }

    pub fn requests(&self, ledger_id: ChannelId) -> Vec<LedgerRequest> {
        self.queue.lock().for_ledger(ledger_id).cloned().collect()
    }

    pub fn cancel(&self, key: &RequestKey, reason: String) {
        self.queue.lock().cancel(key, reason)
    }

    /// Puts `request` in place of the one with the same key.
    pub fn replace(&self, request: LedgerRequest) {
        self.queue.lock().replace(request)
    }

    /// Advances the ledger channel as far as this participant can on its
    /// own. Returns the states to send to the other participants.
    pub fn crank(
        &self,
        ledger_id: ChannelId,
        store: &SignedStateStore,
        signer: &Signer,
    ) -> Result<Vec<SignedState>, LedgerError> {
        let constants = store
            .constants(ledger_id)
            .ok_or(LedgerError::UnknownLedger(ledger_id))?;
        if !matches!(store.registry().rules(constants.app_definition())?, AppRules::Consensus) {
            return Err(LedgerError::NotALedger(ledger_id));
        }
        let me = constants
            .index_of(signer.address())
            .ok_or(LedgerError::NotAParticipant(ledger_id))?;

        let supported = match store.supported_state(ledger_id) {
            Some(s) => s.state,
            None => return Ok(Vec::new()),
        };
        let mut queue = self.queue.lock();

        if supported.is_final {
            let keys: Vec<_> = queue.outstanding(ledger_id).map(LedgerRequest::key).collect();
            for key in keys {
                queue.cancel(&key, "ledger channel is closed".into());
            }
            return Ok(Vec::new());
        }
        // Funds move only once the ledger itself is funded.
        if supported.turn_num < constants.post_fund_turn() {
            return Ok(Vec::new());
        }
        queue.record_agreed_turn(ledger_id, supported.turn_num, &supported.outcome);

        let latest = store
            .latest_state(ledger_id)
            .map(|s| s.state)
            .unwrap_or_else(|| supported.clone());

        let mut out = Vec::new();
        if latest.turn_num > supported.turn_num {
            let data = ConsensusData::from_state(&latest)?;
            if data.is_settled() {
                if !store.has_signed(ledger_id, latest.turn_num, me) {
                    debug!(ledger_id = ?ledger_id, turn_num = latest.turn_num, "countersigning ledger state");
                    out.push(store.sign_and_add(&latest, signer)?);
                }
            } else if constants.mover(latest.turn_num + 1) == me {
                let matching = queue
                    .outstanding(ledger_id)
                    .find(|r| {
                        r.apply(&latest.outcome, &constants).ok().as_ref() == Some(&data.proposed_outcome)
                    })
                    .map(LedgerRequest::key);
                let next = match matching {
                    Some(key) => {
                        if let Some(r) = queue.get_mut(&key) {
                            r.status = RequestStatus::Pending;
                            r.proposed_outcome = Some(data.proposed_outcome.clone());
                        }
                        info!(ledger_id = ?ledger_id, turn_num = latest.turn_num + 1, ?key, "voting on ledger proposal");
                        consensus::vote(&latest)?
                    }
                    None => {
                        warn!(ledger_id = ?ledger_id, turn_num = latest.turn_num + 1, "vetoing ledger proposal without a matching request");
                        consensus::veto(&latest)
                    }
                };
                out.push(store.sign_and_add(&next, signer)?);
            }
        } else if constants.mover(supported.turn_num + 1) == me {
            while let Some(key) = queue.select(ledger_id) {
                let request = match queue.get(&key) {
                    Some(r) => r.clone(),
                    None => break,
                };
                match request.apply(&supported.outcome, &constants) {
                    Ok(proposed) => {
                        if let Some(r) = queue.get_mut(&key) {
                            r.status = RequestStatus::Pending;
                            r.proposed_outcome = Some(proposed.clone());
                        }
                        info!(ledger_id = ?ledger_id, turn_num = supported.turn_num + 1, ?key, "proposing ledger request");
                        let next = consensus::propose(&supported, proposed);
                        out.push(store.sign_and_add(&next, signer)?);
                        break;
                    }
                    Err(e) => queue.cancel(&key, e.to_string()),
                }
            }
        }

        // A final vote or veto of our own may already be agreed on.
        if let Some(s) = store.supported_state(ledger_id) {
            queue.record_agreed_turn(ledger_id, s.state.turn_num, &s.state.outcome);
        }
        Ok(out)
    }
}
