//! Signed State Store: the only place where channel histories change.
//!
//! Every channel has its own record behind its own lock, so adding a state
//! (validate, merge signatures, persist) is atomic per channel while other
//! channels proceed independently. Accepted changes are announced on a
//! broadcast channel for the ledger and objective machinery to pick up.

pub mod persistence;

use crate::{
    abiencode::{
        self,
        types::{Hash, Signature},
    },
    channel::{ChannelConstants, ChannelError, ChannelId, PartIdx, SignedState, State},
    sig::Signer,
    validator::{AppRegistry, TransitionError},
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

pub use persistence::{MemoryPersistence, Persistence, PersistenceError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
    #[error("invalid transition: {0}")]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("state carries no signatures")]
    NoSignatures,
    #[error("constants differ from the ones stored for channel {0}")]
    ConstantsMismatch(ChannelId),
    #[error("a different state is already stored for turn {0}")]
    ConflictingState(u64),
    #[error("participant {participant} already signed turn {signed_turn}, cannot sign turn {turn}")]
    Rollback {
        participant: PartIdx,
        signed_turn: u64,
        turn: u64,
    },
    #[error("turn {turn} is not newer than the supported turn {supported}")]
    Stale { turn: u64, supported: u64 },
    #[error("channel is finalized at turn {0}")]
    Finalized(u64),
    #[error("turn {turn} lacks the signature of participant {mover}, whose turn it is")]
    NotMover { turn: u64, mover: PartIdx },
    #[error("too many states are waiting for their predecessor")]
    QueueFull,
    #[error("channel {0} is unknown")]
    UnknownChannel(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The state or some of its signatures are new.
    Accepted { supported_turn: Option<u64> },
    /// Everything in it was known already.
    Duplicate,
    /// Its predecessor is missing, it is retried once more states arrive.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    ChannelUpdated {
        channel_id: ChannelId,
        turn_num: u64,
        supported_turn: Option<u64>,
    },
}

#[derive(Debug, Clone)]
struct StoredState {
    state: State,
    hash: Hash,
    signatures: BTreeMap<PartIdx, Signature>,
}

impl StoredState {
    fn to_signed(&self) -> SignedState {
        SignedState::from_signers(self.state.clone(), &self.signatures)
    }
}

/// History of one channel.
#[derive(Debug)]
struct ChannelRecord {
    constants: Arc<ChannelConstants>,
    states: BTreeMap<u64, StoredState>,
    supported_turn: Option<u64>,
    /// Latest (turn, hash) each participant signed.
    latest_signed: Vec<Option<(u64, Hash)>>,
    queued: Vec<SignedState>,
}

impl ChannelRecord {
    fn new(constants: Arc<ChannelConstants>) -> Self {
        let n = constants.num_participants();
        Self {
            constants,
            states: BTreeMap::new(),
            supported_turn: None,
            latest_signed: vec![None; n],
            queued: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.states.is_empty() && self.queued.is_empty()
    }

    fn supported(&self) -> Option<&StoredState> {
        self.supported_turn.and_then(|t| self.states.get(&t))
    }

    fn check_rollback(
        &self,
        signers: impl Iterator<Item = PartIdx>,
        turn: u64,
        hash: Hash,
    ) -> Result<(), StoreError> {
        for idx in signers {
            if let Some((signed_turn, signed_hash)) = self.latest_signed[idx] {
                if signed_turn > turn || (signed_turn == turn && signed_hash != hash) {
                    return Err(StoreError::Rollback {
                        participant: idx,
                        signed_turn,
                        turn,
                    });
                }
            }
        }
        Ok(())
    }

    fn record_signatures(&mut self, turn: u64, hash: Hash, signers: impl Iterator<Item = PartIdx>) {
        for idx in signers {
            if self.latest_signed[idx].map_or(true, |(t, _)| t < turn) {
                self.latest_signed[idx] = Some((turn, hash));
            }
        }
        let n = self.constants.num_participants();
        if self.states.get(&turn).map_or(false, |s| s.signatures.len() == n)
            && self.supported_turn.map_or(true, |s| s < turn)
        {
            self.supported_turn = Some(turn);
        }
    }

    fn predecessor(&self, state: &State) -> Option<&StoredState> {
        if state.turn_num == 0 {
            return None;
        }
        self.states.get(&(state.turn_num - 1)).or_else(|| {
            if state.is_postfund() {
                self.states.get(&0)
            } else {
                None
            }
        })
    }

    fn add(
        &mut self,
        signed: &SignedState,
        signers: BTreeMap<PartIdx, Signature>,
        registry: &AppRegistry,
        max_queued: usize,
    ) -> Result<AddOutcome, StoreError> {
        let state = &signed.state;
        let turn = state.turn_num;
        let hash = state.hash()?;

        if let Some(existing) = self.states.get(&turn) {
            if existing.hash != hash {
                return Err(StoreError::ConflictingState(turn));
            }
            let new: Vec<PartIdx> = signers
                .keys()
                .filter(|idx| !existing.signatures.contains_key(idx))
                .copied()
                .collect();
            if new.is_empty() {
                return Ok(AddOutcome::Duplicate);
            }
            self.check_rollback(new.iter().copied(), turn, hash)?;
            if let Some(existing) = self.states.get_mut(&turn) {
                for idx in &new {
                    existing.signatures.insert(*idx, signers[idx]);
                }
            }
            self.record_signatures(turn, hash, new.into_iter());
            return Ok(AddOutcome::Accepted {
                supported_turn: self.supported_turn,
            });
        }

        if let Some(supported) = self.supported() {
            if supported.state.is_final {
                return Err(StoreError::Finalized(supported.state.turn_num));
            }
            if turn <= supported.state.turn_num {
                return Err(StoreError::Stale {
                    turn,
                    supported: supported.state.turn_num,
                });
            }
        }
        self.check_rollback(signers.keys().copied(), turn, hash)?;

        let self_supporting = signers.len() == self.constants.num_participants();
        if !self_supporting && turn > 0 {
            let predecessor = match self.predecessor(state).map(|p| p.state.clone()) {
                Some(p) => p,
                None => return self.enqueue(signed, max_queued),
            };
            registry.validate_transition(&predecessor, state)?;

            let rules = registry.rules(self.constants.app_definition())?;
            let mover = self.constants.mover(turn);
            // Setup states may be signed in any order.
            let in_setup = turn <= self.constants.post_fund_turn();
            if rules.requires_turn_taking()
                && !in_setup
                && !state.is_final
                && !signers.contains_key(&mover)
            {
                return Err(StoreError::NotMover { turn, mover });
            }
        }

        let signer_idxs: Vec<PartIdx> = signers.keys().copied().collect();
        self.states.insert(
            turn,
            StoredState {
                state: state.clone(),
                hash,
                signatures: signers,
            },
        );
        self.record_signatures(turn, hash, signer_idxs.into_iter());
        Ok(AddOutcome::Accepted {
            supported_turn: self.supported_turn,
        })
    }

    fn enqueue(&mut self, signed: &SignedState, max_queued: usize) -> Result<AddOutcome, StoreError> {
        if let Some(queued) = self.queued.iter_mut().find(|q| q.state == signed.state) {
            for sig in &signed.signatures {
                if !queued.signatures.contains(sig) {
                    queued.signatures.push(*sig);
                }
            }
            return Ok(AddOutcome::Queued);
        }
        if self.queued.len() >= max_queued {
            return Err(StoreError::QueueFull);
        }
        self.queued.push(signed.clone());
        Ok(AddOutcome::Queued)
    }
}

pub struct SignedStateStore {
    registry: AppRegistry,
    persistence: Arc<dyn Persistence>,
    channels: RwLock<HashMap<ChannelId, Arc<Mutex<ChannelRecord>>>>,
    events: broadcast::Sender<StoreEvent>,
    max_queued: usize,
}

impl core::fmt::Debug for SignedStateStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignedStateStore")
            .field("channels", &self.channels.read().len())
            .finish()
    }
}

impl SignedStateStore {
    pub fn new(
        registry: AppRegistry,
        persistence: Arc<dyn Persistence>,
        max_queued: usize,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            registry,
            persistence,
            channels: RwLock::new(HashMap::new()),
            events,
            max_queued,
        }
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn record(&self, id: ChannelId) -> Option<Arc<Mutex<ChannelRecord>>> {
        self.channels.read().get(&id).cloned()
    }

    fn record_or_create(&self, constants: &Arc<ChannelConstants>) -> Arc<Mutex<ChannelRecord>> {
        self.channels
            .write()
            .entry(constants.id())
            .or_insert_with(|| Arc::new(Mutex::new(ChannelRecord::new(constants.clone()))))
            .clone()
    }

    /// Validates `signed` against the channel history and merges it in.
    pub fn add_signed_state(&self, signed: &SignedState) -> Result<AddOutcome, StoreError> {
        let id = signed.state.channel_id();
        let turn = signed.state.turn_num;
        let result = self.add_inner(signed);
        match &result {
            Ok(AddOutcome::Accepted { supported_turn }) => {
                debug!(channel_id = ?id, turn_num = turn, ?supported_turn, "signed state accepted")
            }
            Ok(AddOutcome::Duplicate) => trace!(channel_id = ?id, turn_num = turn, "duplicate signed state"),
            Ok(AddOutcome::Queued) => {
                debug!(channel_id = ?id, turn_num = turn, "signed state queued for its predecessor")
            }
            Err(e) => warn!(channel_id = ?id, turn_num = turn, error = %e, "signed state rejected"),
        }
        result
    }

    fn add_inner(&self, signed: &SignedState) -> Result<AddOutcome, StoreError> {
        let signers = signed.signers()?;
        if signers.is_empty() {
            return Err(StoreError::NoSignatures);
        }

        let constants = &signed.state.constants;
        let record = self.record_or_create(constants);
        let mut record = record.lock();

        if record.is_empty() {
            // Nothing is bound to the channel yet, the first state decides.
            if record.constants != *constants {
                *record = ChannelRecord::new(constants.clone());
            }
        } else if record.constants != *constants {
            return Err(StoreError::ConstantsMismatch(constants.id()));
        }

        let outcome = record.add(signed, signers, &self.registry, self.max_queued)?;
        if let AddOutcome::Accepted { .. } = outcome {
            self.persist(&record, signed.state.turn_num)?;
            self.drain_queue(&mut record);
        }
        Ok(outcome)
    }

    fn persist(&self, record: &ChannelRecord, turn: u64) -> Result<(), StoreError> {
        let stored = match record.states.get(&turn) {
            Some(s) => s,
            None => return Ok(()),
        };
        self.persistence.store_constants(&record.constants)?;
        self.persistence.append_signed_state(&stored.to_signed())?;
        let _ = self.events.send(StoreEvent::ChannelUpdated {
            channel_id: record.constants.id(),
            turn_num: turn,
            supported_turn: record.supported_turn,
        });
        if record.supported_turn == Some(turn) {
            info!(channel_id = ?record.constants.id(), turn_num = turn, "new supported state");
        }
        Ok(())
    }

    /// Retries queued states until none of them makes progress.
    fn drain_queue(&self, record: &mut ChannelRecord) {
        loop {
            let queued = std::mem::take(&mut record.queued);
            if queued.is_empty() {
                return;
            }
            let mut progressed = false;
            for signed in queued {
                let signers = match signed.signers() {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                match record.add(&signed, signers, &self.registry, self.max_queued) {
                    Ok(AddOutcome::Accepted { .. }) => {
                        progressed = true;
                        if let Err(e) = self.persist(record, signed.state.turn_num) {
                            warn!(error = %e, "persisting a dequeued state failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(turn_num = signed.state.turn_num, error = %e, "dropping queued state")
                    }
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// Signs `state`, merges the signature with any partial signatures known
    /// for the same turn and returns the merged result.
    pub fn sign_and_add(&self, state: &State, signer: &Signer) -> Result<SignedState, StoreError> {
        let signed = state.sign(signer)?;
        self.add_signed_state(&signed)?;
        Ok(self
            .signed_state(state.channel_id(), state.turn_num)
            .unwrap_or(signed))
    }

    /// Highest turn carrying every participant's signature.
    pub fn supported_state(&self, channel_id: ChannelId) -> Option<SignedState> {
        let record = self.record(channel_id)?;
        let record = record.lock();
        record.supported().map(StoredState::to_signed)
    }

    /// Highest stored turn, supported or not.
    pub fn latest_state(&self, channel_id: ChannelId) -> Option<SignedState> {
        let record = self.record(channel_id)?;
        let record = record.lock();
        record.states.values().next_back().map(StoredState::to_signed)
    }

    pub fn signed_state(&self, channel_id: ChannelId, turn_num: u64) -> Option<SignedState> {
        let record = self.record(channel_id)?;
        let record = record.lock();
        record.states.get(&turn_num).map(StoredState::to_signed)
    }

    /// Stored states at or above the supported turn, oldest first.
    pub fn live_states(&self, channel_id: ChannelId) -> Vec<SignedState> {
        let record = match self.record(channel_id) {
            Some(r) => r,
            None => return Vec::new(),
        };
        let record = record.lock();
        let from = record.supported_turn.unwrap_or(0);
        record
            .states
            .range(from..)
            .map(|(_, s)| s.to_signed())
            .collect()
    }

    pub fn constants(&self, channel_id: ChannelId) -> Option<Arc<ChannelConstants>> {
        let record = self.record(channel_id)?;
        let record = record.lock();
        if record.is_empty() {
            None
        } else {
            Some(record.constants.clone())
        }
    }

    /// Whether participant `idx` has signed `turn_num`.
    pub fn has_signed(&self, channel_id: ChannelId, turn_num: u64, idx: PartIdx) -> bool {
        self.record(channel_id)
            .map(|r| {
                r.lock()
                    .states
                    .get(&turn_num)
                    .map_or(false, |s| s.signatures.contains_key(&idx))
            })
            .unwrap_or(false)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.read().keys().copied().collect()
    }
}
