//! The per-participant engine.
//!
//! [Engine] owns the signed state store, the objectives and the ledger
//! funder of one signer. Every public call feeds its input in, cranks
//! objectives and ledgers until they settle, runs the chain calls they asked
//! for and hands the resulting messages to the bus.

use crate::{
    abiencode::{
        self,
        types::{Address, U256},
    },
    chain::{ChainError, ChainService, ChainUpdate},
    challenge::{ChallengeCoordinator, ChallengeOutcome, ChallengeState},
    channel::{
        challenge_message, ChannelConstants, ChannelError, ChannelId, Outcome, Participant,
        SignedState, State,
    },
    config::EngineConfig,
    ledger::{LedgerError, LedgerFunder, LedgerRequest, RequestKind},
    messages::{Message, Payload, Rejection},
    objective::{
        CloseChannel, CrankContext, FundingStrategy, Objective, ObjectiveEffect, ObjectiveError,
        ObjectiveId, ObjectiveKind, ObjectiveRequest, ObjectiveStatus, OpenChannel,
    },
    sig::{SigError, Signer},
    store::{Persistence, PersistenceError, SignedStateStore, StoreError, StoreEvent},
    validator::{AppRegistry, AppRules},
    wire::{decode_message, MessageBus, WireError},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TryRecvError},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("payload version {theirs} is incompatible with {ours}")]
    IncompatibleVersion { theirs: String, ours: String },
    #[error("channel {0} is unknown")]
    UnknownChannel(ChannelId),
    #[error("objective {0} is unknown")]
    UnknownObjective(ObjectiveId),
    #[error("we are not a participant of channel {0}")]
    NotAParticipant(ChannelId),
    #[error("channel {0} is not running yet")]
    ChannelNotRunning(ChannelId),
    #[error("channel {0} is finalized")]
    ChannelFinalized(ChannelId),
    #[error("channel {0} has an update in flight")]
    UpdateInFlight(ChannelId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Objective(#[from] ObjectiveError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("encoding: {0}")]
    Encoding(#[from] abiencode::Error),
    #[error("signature: {0}")]
    Signature(#[from] SigError),
}

/// Everything needed to propose a new channel. The nonce is allocated by the
/// engine.
#[derive(Debug, Clone)]
pub struct CreateChannelParams {
    pub chain_id: U256,
    pub participants: Vec<Participant>,
    pub app_definition: Address,
    pub challenge_duration: u64,
    pub outcome: Outcome,
    pub app_data: Vec<u8>,
    pub funding: FundingStrategy,
}

/// Outbound payloads of one engine call, merged per (sender, recipient).
#[derive(Debug, Default)]
struct Outbox {
    payloads: BTreeMap<(String, String), Payload>,
}

impl Outbox {
    fn payload(&mut self, sender: &str, recipient: &str, version: &str) -> &mut Payload {
        self.payloads
            .entry((sender.to_string(), recipient.to_string()))
            .or_insert_with(|| Payload::new(version))
    }
}

#[derive(Debug)]
enum ChainAction {
    Watch(ChannelId),
    Deposit {
        objective: ObjectiveId,
        channel_id: ChannelId,
        asset_holder: Address,
        expected_held: U256,
        amount: U256,
    },
    Conclude {
        objective: ObjectiveId,
        proof: SignedState,
    },
}

/// One participant's engine: it keeps the channels of a single signer and
/// talks to the other participants through `bus`.
///
/// Every call that may change something runs the crank loop before it
/// returns, so all follow-up messages are sent by then.
#[derive(Debug)]
pub struct Engine<B: MessageBus> {
    pub(crate) config: EngineConfig,
    pub(crate) signer: Signer,
    pub(crate) bus: B,
    store: SignedStateStore,
    funder: LedgerFunder,
    chain: Arc<dyn ChainService>,
    objectives: Mutex<BTreeMap<ObjectiveId, Objective>>,
    chain_status: Mutex<HashMap<ChannelId, ChainUpdate>>,
    feeds: Mutex<HashMap<ChannelId, mpsc::Receiver<ChainUpdate>>>,
    store_events: Mutex<broadcast::Receiver<StoreEvent>>,
}

impl<B: MessageBus> Engine<B> {
    /// Engine knowing the null and consensus apps.
    pub fn new(
        config: EngineConfig,
        signer: Signer,
        chain: Arc<dyn ChainService>,
        persistence: Arc<dyn Persistence>,
        bus: B,
    ) -> Self {
        Self::with_registry(config, AppRegistry::default(), signer, chain, persistence, bus)
    }

    pub fn with_registry(
        config: EngineConfig,
        registry: AppRegistry,
        signer: Signer,
        chain: Arc<dyn ChainService>,
        persistence: Arc<dyn Persistence>,
        bus: B,
    ) -> Self {
        let store = SignedStateStore::new(
            registry,
            persistence,
            config.max_queued_states_per_channel,
            config.store_event_capacity,
        );
        let store_events = Mutex::new(store.subscribe());
        let funder = LedgerFunder::new(config.scheduling_policy);
        Self {
            config,
            signer,
            bus,
            store,
            funder,
            chain,
            objectives: Mutex::new(BTreeMap::new()),
            chain_status: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            store_events,
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn store(&self) -> &SignedStateStore {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Proposes a channel to the other participants and starts opening it.
    pub async fn create_channel(&self, params: CreateChannelParams) -> Result<ChannelId, EngineError> {
        let addresses: Vec<Address> = params.participants.iter().map(|p| p.signing_address).collect();
        let nonce = self.store.persistence().reserve_nonce(&addresses)?;
        let constants = Arc::new(ChannelConstants::new(
            params.chain_id,
            params.participants,
            nonce,
            params.app_definition,
            params.challenge_duration,
        )?);
        let channel_id = constants.id();
        if constants.index_of(self.address()).is_none() {
            return Err(EngineError::NotAParticipant(channel_id));
        }
        if let FundingStrategy::Ledger { ledger_channel_id } = params.funding {
            self.check_ledger(ledger_channel_id)?;
        }

        let prefund = State::prefund(constants.clone(), params.outcome, params.app_data);
        let signed = self.store.sign_and_add(&prefund, &self.signer)?;
        let objective = Objective::new(
            ObjectiveKind::OpenChannel(OpenChannel::new(constants.clone(), params.funding)),
            ObjectiveStatus::Approved,
        );
        let request = objective.request();
        info!(channel_id = ?channel_id, objective_id = %objective.id(), "channel proposed");
        self.objectives.lock().insert(objective.id().clone(), objective);

        let mut outbox = Outbox::default();
        self.to_peers(&mut outbox, &constants, |p| {
            p.objectives.push(request.clone());
            p.signed_states.push(signed.clone());
        });
        self.crank(&mut outbox).await;
        self.flush(outbox);
        Ok(channel_id)
    }

    /// Lets an objective proposed by someone else go ahead. Approving twice
    /// does nothing.
    pub async fn approve_objective(&self, id: &ObjectiveId) -> Result<(), EngineError> {
        let approved = self
            .objectives
            .lock()
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownObjective(id.clone()))?
            .approve();
        if approved {
            let mut outbox = Outbox::default();
            self.crank(&mut outbox).await;
            self.flush(outbox);
        }
        Ok(())
    }

    /// Signs the state after the supported one with a new outcome and app
    /// data. If another participant already signed exactly that state, this
    /// countersigns it.
    pub async fn update_channel(
        &self,
        channel_id: ChannelId,
        outcome: Outcome,
        app_data: Vec<u8>,
    ) -> Result<SignedState, EngineError> {
        let constants = self
            .store
            .constants(channel_id)
            .ok_or(EngineError::UnknownChannel(channel_id))?;
        let me = constants
            .index_of(self.address())
            .ok_or(EngineError::NotAParticipant(channel_id))?;
        let supported = self
            .store
            .supported_state(channel_id)
            .ok_or(EngineError::ChannelNotRunning(channel_id))?
            .state;
        if supported.is_final {
            return Err(EngineError::ChannelFinalized(channel_id));
        }
        if supported.turn_num < constants.post_fund_turn() {
            return Err(EngineError::ChannelNotRunning(channel_id));
        }

        let mut next = supported.make_next_state();
        next.outcome = outcome;
        next.app_data = app_data;
        if let Some(latest) = self.store.latest_state(channel_id) {
            let in_flight = latest.state.turn_num > supported.turn_num;
            if in_flight && (latest.state != next || self.store.has_signed(channel_id, next.turn_num, me)) {
                return Err(EngineError::UpdateInFlight(channel_id));
            }
        }

        let signed = self.store.sign_and_add(&next, &self.signer)?;
        info!(channel_id = ?channel_id, turn_num = next.turn_num, "channel updated");
        let mut outbox = Outbox::default();
        self.to_peers(&mut outbox, &constants, |p| p.signed_states.push(signed.clone()));
        self.crank(&mut outbox).await;
        self.flush(outbox);
        Ok(signed)
    }

    /// Starts closing a channel. Closing a channel someone else already
    /// asked to close approves their objective.
    pub async fn close_channel(&self, channel_id: ChannelId) -> Result<ObjectiveId, EngineError> {
        let constants = self
            .store
            .constants(channel_id)
            .ok_or(EngineError::UnknownChannel(channel_id))?;
        if constants.index_of(self.address()).is_none() {
            return Err(EngineError::NotAParticipant(channel_id));
        }
        let funding = self.funding_of(channel_id);
        let id = ObjectiveId::close_channel(channel_id);
        {
            let mut objectives = self.objectives.lock();
            match objectives.get_mut(&id) {
                Some(existing) => {
                    existing.approve();
                }
                None => {
                    info!(channel_id = ?channel_id, objective_id = %id, "closing channel");
                    let objective = Objective::new(
                        ObjectiveKind::CloseChannel(CloseChannel::new(channel_id, funding)),
                        ObjectiveStatus::Approved,
                    );
                    objectives.insert(id.clone(), objective);
                }
            }
        }

        let mut outbox = Outbox::default();
        let request = ObjectiveRequest::CloseChannel { channel_id };
        self.to_peers(&mut outbox, &constants, |p| p.objectives.push(request.clone()));
        self.crank(&mut outbox).await;
        self.flush(outbox);
        Ok(id)
    }

    /// Handles a framed message as produced by
    /// [crate::wire::ProtoBufEncodingLayer].
    pub async fn push_bytes(&self, frame: &[u8]) -> Result<(), EngineError> {
        let msg = decode_message(frame)?;
        self.push_message(msg).await
    }

    /// Handles a message from another participant. Items that cannot be
    /// accepted are answered with a rejection. Delivering a message twice
    /// has no further effect.
    pub async fn push_message(&self, msg: Message) -> Result<(), EngineError> {
        if !msg.payload.is_compatible_with(&self.config.wallet_version) {
            warn!(sender = %msg.sender, version = %msg.payload.wallet_version, "dropping payload of incompatible version");
            return Err(EngineError::IncompatibleVersion {
                theirs: msg.payload.wallet_version,
                ours: self.config.wallet_version.clone(),
            });
        }
        let Message {
            sender,
            recipient,
            payload,
        } = msg;
        let mut outbox = Outbox::default();
        let mut rejections = Vec::new();

        for request in payload.objectives {
            let channel_id = request.channel_id();
            if let Err(e) = self.receive_objective(request, &mut outbox) {
                warn!(channel_id = ?channel_id, from = %sender, error = %e, "rejecting objective");
                rejections.push(Rejection {
                    channel_id,
                    turn_num: 0,
                    reason: e.to_string(),
                });
            }
        }
        for request in payload.ledger_requests {
            let ledger_id = request.ledger_channel_id;
            if let Err(e) = self.receive_ledger_request(request) {
                warn!(ledger_id = ?ledger_id, from = %sender, error = %e, "rejecting ledger request");
                rejections.push(Rejection {
                    channel_id: ledger_id,
                    turn_num: 0,
                    reason: e.to_string(),
                });
            }
        }
        for signed in &payload.signed_states {
            let channel_id = signed.state.channel_id();
            let turn_num = signed.state.turn_num;
            match self.store.add_signed_state(signed) {
                Ok(outcome) => {
                    debug!(channel_id = ?channel_id, turn_num, ?outcome, from = %sender, "signed state received")
                }
                Err(e) => {
                    warn!(channel_id = ?channel_id, turn_num, from = %sender, error = %e, "rejecting signed state");
                    rejections.push(Rejection {
                        channel_id,
                        turn_num,
                        reason: e.to_string(),
                    });
                }
            }
        }
        for r in &payload.rejections {
            warn!(channel_id = ?r.channel_id, turn_num = r.turn_num, from = %sender, reason = %r.reason, "peer rejected our message");
        }

        if !rejections.is_empty() {
            outbox
                .payload(&recipient, &sender, &self.config.wallet_version)
                .rejections
                .extend(rejections);
        }
        self.crank(&mut outbox).await;
        self.flush(outbox);
        Ok(())
    }

    /// Takes note of a chain status change that did not arrive through one
    /// of the feeds the engine subscribed to itself.
    pub async fn handle_chain_update(&self, update: ChainUpdate) {
        self.record_chain_update(update);
        let mut outbox = Outbox::default();
        self.crank(&mut outbox).await;
        self.flush(outbox);
    }

    /// Processes whatever the chain feeds delivered since the last call.
    pub async fn poll_chain(&self) {
        let mut outbox = Outbox::default();
        self.crank(&mut outbox).await;
        self.flush(outbox);
    }

    /// Challenges the channel on chain with its supported state and waits
    /// for the dispute to end. A finalized channel is paid out and its
    /// unfinished objectives fail.
    pub async fn challenge(&self, channel_id: ChannelId) -> Result<ChallengeState, EngineError> {
        let candidate = self
            .store
            .supported_state(channel_id)
            .ok_or(EngineError::ChannelNotRunning(channel_id))?;
        let turn_num = candidate.state.turn_num;
        let signature = self.signer.sign_eth(challenge_message(channel_id, turn_num)?)?;
        self.chain.register_channel(channel_id).await?;

        info!(channel_id = ?channel_id, turn_num, "challenging channel");
        let coordinator = ChallengeCoordinator::new(self.chain.clone(), self.config.challenge.clone());
        let result = coordinator.run(candidate.clone(), signature).await;

        if result == ChallengeState::Done(ChallengeOutcome::Finalized) {
            match self.chain.conclude_and_withdraw(candidate).await {
                Ok(tx) => {
                    if let Err(e) = self.chain.wait_for_transaction(tx).await {
                        warn!(channel_id = ?channel_id, error = %e, "withdrawal not mined");
                    }
                }
                Err(e) => error!(channel_id = ?channel_id, error = %e, "withdrawal after challenge failed"),
            }
            for objective in self.objectives.lock().values_mut() {
                if objective.channel_id() == channel_id {
                    objective.fail("channel finalized by a challenge");
                }
            }
        }
        if let Err(e) = self.chain.unregister_channel(channel_id).await {
            warn!(channel_id = ?channel_id, error = %e, "cannot unregister channel");
        }

        let mut outbox = Outbox::default();
        self.crank(&mut outbox).await;
        self.flush(outbox);
        Ok(result)
    }

    /// Gives up on an objective. Ledger requests it queued are cancelled,
    /// states already signed stay signed.
    pub fn cancel_objective(&self, id: &ObjectiveId, reason: &str) -> Result<(), EngineError> {
        let mut objectives = self.objectives.lock();
        let objective = objectives
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownObjective(id.clone()))?;
        if objective.status().is_terminal() {
            return Ok(());
        }
        objective.fail(format!("cancelled: {}", reason));

        let (channel_id, funding, kind) = match objective.kind() {
            ObjectiveKind::OpenChannel(o) => (o.channel_id(), o.funding(), RequestKind::Fund),
            ObjectiveKind::CloseChannel(c) => (c.channel_id(), c.funding(), RequestKind::Defund),
        };
        if let FundingStrategy::Ledger { ledger_channel_id } = funding {
            if let Some(r) = self
                .funder
                .requests(ledger_channel_id)
                .into_iter()
                .find(|r| r.channel_to_be_funded == channel_id && r.kind == kind)
            {
                if r.status.is_outstanding() {
                    self.funder.cancel(&r.key(), "objective cancelled".into());
                }
            }
        }
        Ok(())
    }

    /// Sends our copies of the channel's live states to the other
    /// participants again, e.g. after a reconnect.
    pub fn sync_channel(&self, channel_id: ChannelId) -> Result<(), EngineError> {
        let mut outbox = Outbox::default();
        self.resend(channel_id, &mut outbox)?;
        self.flush(outbox);
        Ok(())
    }

    /// Unfinished objectives without progress for longer than the configured
    /// timeout.
    pub fn stalled_objectives(&self) -> Vec<ObjectiveId> {
        let timeout = self.config.objective_timeout();
        self.objectives
            .lock()
            .values()
            .filter(|o| !o.status().is_terminal() && o.last_progress().elapsed() > timeout)
            .map(|o| o.id().clone())
            .collect()
    }

    pub fn get_objective(&self, id: &ObjectiveId) -> Option<Objective> {
        self.objectives.lock().get(id).cloned()
    }

    pub fn supported_state(&self, channel_id: ChannelId) -> Option<SignedState> {
        self.store.supported_state(channel_id)
    }

    pub fn ledger_requests(&self, ledger_id: ChannelId) -> Vec<LedgerRequest> {
        self.funder.requests(ledger_id)
    }

    /// Whether the engine follows the channel's chain feed.
    pub fn is_watching(&self, channel_id: ChannelId) -> bool {
        self.feeds.lock().contains_key(&channel_id)
    }

    fn check_ledger(&self, ledger_id: ChannelId) -> Result<(), EngineError> {
        let ledger = self
            .store
            .constants(ledger_id)
            .ok_or(EngineError::UnknownChannel(ledger_id))?;
        if ledger.index_of(self.address()).is_none() {
            return Err(EngineError::NotAParticipant(ledger_id));
        }
        Ok(())
    }

    fn funding_of(&self, channel_id: ChannelId) -> FundingStrategy {
        match self
            .objectives
            .lock()
            .get(&ObjectiveId::open_channel(channel_id))
            .map(Objective::kind)
        {
            Some(ObjectiveKind::OpenChannel(o)) => o.funding(),
            _ => FundingStrategy::Direct,
        }
    }

    fn receive_objective(&self, request: ObjectiveRequest, outbox: &mut Outbox) -> Result<(), EngineError> {
        let id = request.id();
        let channel_id = request.channel_id();
        if self.objectives.lock().contains_key(&id) {
            debug!(objective_id = %id, "objective already known");
            // The sender may have missed our answers.
            if self.store.constants(channel_id).is_some() {
                self.resend(channel_id, outbox)?;
            }
            return Ok(());
        }

        let kind = match request {
            ObjectiveRequest::OpenChannel { constants, funding } => {
                if constants.index_of(self.address()).is_none() {
                    return Err(EngineError::NotAParticipant(channel_id));
                }
                if let FundingStrategy::Ledger { ledger_channel_id } = funding {
                    self.check_ledger(ledger_channel_id)?;
                }
                ObjectiveKind::OpenChannel(OpenChannel::new(Arc::new(constants), funding))
            }
            ObjectiveRequest::CloseChannel { channel_id } => {
                let constants = self
                    .store
                    .constants(channel_id)
                    .ok_or(EngineError::UnknownChannel(channel_id))?;
                if constants.index_of(self.address()).is_none() {
                    return Err(EngineError::NotAParticipant(channel_id));
                }
                let funding = self.funding_of(channel_id);
                ObjectiveKind::CloseChannel(CloseChannel::new(channel_id, funding))
            }
        };
        info!(objective_id = %id, "objective proposed, waiting for approval");
        self.objectives
            .lock()
            .entry(id)
            .or_insert_with(|| Objective::new(kind, ObjectiveStatus::PendingApproval));
        Ok(())
    }

    /// Requests of others only matter once we pursue the same objective,
    /// until then our own objective has not agreed to move any funds. They
    /// must ask for exactly what our objective would ask for.
    fn receive_ledger_request(&self, request: LedgerRequest) -> Result<(), EngineError> {
        let ledger_id = request.ledger_channel_id;
        self.check_ledger(ledger_id)?;
        let objective_id = match request.kind {
            RequestKind::Fund => ObjectiveId::open_channel(request.channel_to_be_funded),
            RequestKind::Defund => ObjectiveId::close_channel(request.channel_to_be_funded),
        };
        let conflict = || LedgerError::ConflictingRequest(request.channel_to_be_funded);

        if let Some(known) = self.funder.request(&request.key()) {
            if !known.same_terms(&request) {
                return Err(conflict().into());
            }
        } else {
            let expected = match self.objectives.lock().get(&objective_id) {
                Some(o) if o.status() == &ObjectiveStatus::Approved => o.ledger_request(&self.store)?,
                _ => {
                    debug!(ledger_id = ?ledger_id, objective_id = %objective_id, "ignoring ledger request of an objective we do not pursue");
                    return Ok(());
                }
            };
            match expected {
                Some(ours) if ours.same_terms(&request) => {}
                Some(ours) => {
                    warn!(ledger_id = ?ledger_id, objective_id = %objective_id, theirs = ?request.amounts, ours = ?ours.amounts, "ledger request with other amounts");
                    return Err(conflict().into());
                }
                None => {
                    // Our objective announces its own once it gets there.
                    debug!(ledger_id = ?ledger_id, objective_id = %objective_id, "ledger request ahead of our objective");
                    return Ok(());
                }
            }
        }
        if self.funder.enqueue(request) {
            debug!(ledger_id = ?ledger_id, objective_id = %objective_id, "ledger request announced");
        }
        Ok(())
    }

    fn resend(&self, channel_id: ChannelId, outbox: &mut Outbox) -> Result<(), EngineError> {
        let constants = self
            .store
            .constants(channel_id)
            .ok_or(EngineError::UnknownChannel(channel_id))?;
        let states = self.store.live_states(channel_id);
        self.to_peers(outbox, &constants, |p| p.signed_states.extend(states.iter().cloned()));
        Ok(())
    }

    fn to_peers(&self, outbox: &mut Outbox, constants: &ChannelConstants, fill: impl Fn(&mut Payload)) {
        let me = match constants.index_of(self.address()) {
            Some(me) => me,
            None => return,
        };
        let sender = &constants.participants()[me].participant_id;
        for (i, p) in constants.participants().iter().enumerate() {
            if i != me {
                fill(outbox.payload(sender, &p.participant_id, &self.config.wallet_version));
            }
        }
    }

    fn flush(&self, outbox: Outbox) {
        for ((sender, recipient), payload) in outbox.payloads {
            if payload.is_empty() {
                continue;
            }
            self.bus.send(Message {
                sender,
                recipient,
                payload,
            });
        }
    }

    /// Cranks ledgers and objectives until nothing changes any more, then
    /// stops watching what no objective needs.
    async fn crank(&self, outbox: &mut Outbox) {
        if !self.settle(outbox).await {
            warn!(
                iterations = self.config.max_crank_iterations,
                "crank loop did not settle"
            );
        }
        self.release_idle_channels().await;
    }

    async fn settle(&self, outbox: &mut Outbox) -> bool {
        for _ in 0..self.config.max_crank_iterations {
            let mut progressed = self.poll_feeds();
            self.note_store_events();

            let mut actions = Vec::new();
            progressed |= self.crank_objectives(outbox, &mut actions);
            progressed |= self.crank_ledgers(outbox);
            progressed |= !actions.is_empty();
            for action in actions {
                self.execute(action).await;
            }
            if !progressed {
                return true;
            }
        }
        false
    }

    /// Unregisters channels without unfinished objectives and forgets their
    /// chain status.
    async fn release_idle_channels(&self) {
        let live: BTreeSet<ChannelId> = self
            .objectives
            .lock()
            .values()
            .filter(|o| !o.status().is_terminal())
            .map(Objective::channel_id)
            .collect();
        let idle: Vec<ChannelId> = {
            let mut feeds = self.feeds.lock();
            let idle: Vec<ChannelId> = feeds.keys().filter(|id| !live.contains(id)).copied().collect();
            for channel_id in &idle {
                feeds.remove(channel_id);
            }
            idle
        };
        self.chain_status.lock().retain(|id, _| live.contains(id));
        for channel_id in idle {
            debug!(channel_id = ?channel_id, "no longer watching channel");
            if let Err(e) = self.chain.unregister_channel(channel_id).await {
                warn!(channel_id = ?channel_id, error = %e, "cannot unregister channel");
            }
        }
    }

    fn crank_objectives(&self, outbox: &mut Outbox, actions: &mut Vec<ChainAction>) -> bool {
        let chain_status = self.chain_status.lock().clone();
        let mut produced = Vec::new();
        for objective in self.objectives.lock().values_mut() {
            let ctx = CrankContext {
                store: &self.store,
                signer: &self.signer,
                funder: &self.funder,
                chain: chain_status.get(&objective.channel_id()),
            };
            let effects = objective.crank(&ctx);
            if !effects.is_empty() {
                produced.push((objective.id().clone(), effects));
            }
        }

        let progressed = !produced.is_empty();
        for (objective, effects) in produced {
            for effect in effects {
                match effect {
                    ObjectiveEffect::SendSignedState(signed) => {
                        let constants = signed.state.constants.clone();
                        self.to_peers(outbox, &constants, |p| p.signed_states.push(signed.clone()));
                    }
                    ObjectiveEffect::SendLedgerRequest(request) => {
                        if let Some(ledger) = self.store.constants(request.ledger_channel_id) {
                            self.to_peers(outbox, &ledger, |p| p.ledger_requests.push(request.clone()));
                        }
                    }
                    ObjectiveEffect::WatchChannel(channel_id) => {
                        actions.push(ChainAction::Watch(channel_id))
                    }
                    ObjectiveEffect::Deposit {
                        channel_id,
                        asset_holder,
                        expected_held,
                        amount,
                    } => actions.push(ChainAction::Deposit {
                        objective: objective.clone(),
                        channel_id,
                        asset_holder,
                        expected_held,
                        amount,
                    }),
                    ObjectiveEffect::ConcludeAndWithdraw(proof) => actions.push(ChainAction::Conclude {
                        objective: objective.clone(),
                        proof,
                    }),
                }
            }
        }
        progressed
    }

    fn crank_ledgers(&self, outbox: &mut Outbox) -> bool {
        let mut progressed = false;
        for ledger_id in self.store.channel_ids() {
            let constants = match self.store.constants(ledger_id) {
                Some(c) => c,
                None => continue,
            };
            let is_ledger = matches!(
                self.store.registry().rules(constants.app_definition()),
                Ok(AppRules::Consensus)
            );
            if !is_ledger || constants.index_of(self.address()).is_none() {
                continue;
            }
            match self.funder.crank(ledger_id, &self.store, &self.signer) {
                Ok(states) if !states.is_empty() => {
                    progressed = true;
                    // Lets the others vote for, or stop vetoing, what we propose.
                    let outstanding: Vec<LedgerRequest> = self
                        .funder
                        .requests(ledger_id)
                        .into_iter()
                        .filter(|r| r.status.is_outstanding())
                        .collect();
                    self.to_peers(outbox, &constants, |p| {
                        p.ledger_requests.extend(outstanding.iter().cloned());
                        p.signed_states.extend(states.iter().cloned());
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(ledger_id = ?ledger_id, error = %e, "ledger crank failed"),
            }
        }
        progressed
    }

    async fn execute(&self, action: ChainAction) {
        match action {
            ChainAction::Watch(channel_id) => {
                if self.feeds.lock().contains_key(&channel_id) {
                    return;
                }
                match self.subscribe(channel_id).await {
                    Ok(feed) => {
                        debug!(channel_id = ?channel_id, "watching channel on chain");
                        self.feeds.lock().insert(channel_id, feed);
                    }
                    Err(e) => warn!(channel_id = ?channel_id, error = %e, "cannot watch channel"),
                }
            }
            ChainAction::Deposit {
                objective,
                channel_id,
                asset_holder,
                expected_held,
                amount,
            } => {
                info!(channel_id = ?channel_id, %amount, %expected_held, "depositing");
                let result = match self
                    .chain
                    .fund_channel(channel_id, asset_holder, expected_held, amount)
                    .await
                {
                    Ok(tx) => self.chain.wait_for_transaction(tx).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(channel_id = ?channel_id, error = %e, "deposit failed");
                    self.chain_call_failed(&objective, &e);
                }
            }
            ChainAction::Conclude { objective, proof } => {
                let channel_id = proof.state.channel_id();
                info!(channel_id = ?channel_id, turn_num = proof.state.turn_num, "concluding channel");
                let result = match self.chain.conclude_and_withdraw(proof).await {
                    Ok(tx) => self.chain.wait_for_transaction(tx).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(channel_id = ?channel_id, error = %e, "conclude failed");
                    self.chain_call_failed(&objective, &e);
                }
            }
        }
    }

    async fn subscribe(&self, channel_id: ChannelId) -> Result<mpsc::Receiver<ChainUpdate>, ChainError> {
        self.chain.register_channel(channel_id).await?;
        self.chain.chain_updated_feed(channel_id).await
    }

    fn chain_call_failed(&self, objective: &ObjectiveId, error: &ChainError) {
        if let Some(o) = self.objectives.lock().get_mut(objective) {
            o.chain_call_failed(error);
        }
    }

    /// Drains the chain feeds. Returns whether anything arrived.
    fn poll_feeds(&self) -> bool {
        let mut updates = Vec::new();
        self.feeds.lock().retain(|channel_id, feed| loop {
            match feed.try_recv() {
                Ok(update) => updates.push(update),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Disconnected) => {
                    debug!(channel_id = ?channel_id, "chain feed closed");
                    break false;
                }
            }
        });
        let progressed = !updates.is_empty();
        for update in updates {
            self.record_chain_update(update);
        }
        progressed
    }

    fn record_chain_update(&self, update: ChainUpdate) {
        let channel_id = update.channel_id;
        if update.challenge_registered() {
            warn!(
                channel_id = ?channel_id,
                turn_num_record = update.turn_num_record,
                finalizes_at = update.finalizes_at,
                "challenge registered on chain"
            );
        }
        for objective in self.objectives.lock().values_mut() {
            if objective.channel_id() == channel_id {
                objective.touch();
            }
        }
        self.chain_status.lock().insert(channel_id, update);
    }

    /// Counts store changes as progress of the objectives of the channel.
    fn note_store_events(&self) {
        let mut updated = BTreeSet::new();
        {
            let mut events = self.store_events.lock();
            loop {
                match events.try_recv() {
                    Ok(StoreEvent::ChannelUpdated { channel_id, .. }) => {
                        updated.insert(channel_id);
                    }
                    Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                        debug!(missed, "store events lagged");
                    }
                    Err(_) => break,
                }
            }
        }
        if updated.is_empty() {
            return;
        }
        for objective in self.objectives.lock().values_mut() {
            if updated.contains(&objective.channel_id()) {
                objective.touch();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::MemoryChain,
        channel::{test_util::signers, AllocationItem},
        store::MemoryPersistence,
        validator::{CONSENSUS_APP, NULL_APP},
    };
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Sent(Mutex<Vec<Message>>);

    impl MessageBus for Arc<Sent> {
        fn send(&self, msg: Message) {
            self.0.lock().push(msg);
        }
    }

    fn engine(signer: Signer, chain: Arc<MemoryChain>) -> (Engine<Arc<Sent>>, Arc<Sent>) {
        let sent = Arc::new(Sent::default());
        let engine = Engine::new(
            EngineConfig::default(),
            signer,
            chain,
            Arc::new(MemoryPersistence::new()),
            sent.clone(),
        );
        (engine, sent)
    }

    fn params(s: &[Signer], funding: FundingStrategy) -> CreateChannelParams {
        let participants: Vec<Participant> = s
            .iter()
            .enumerate()
            .map(|(i, s)| Participant::new(s.address(), format!("p{}", i)))
            .collect();
        let items = participants
            .iter()
            .map(|p| AllocationItem::new(p.destination, 5.into()))
            .collect();
        CreateChannelParams {
            chain_id: 1.into(),
            participants,
            app_definition: NULL_APP,
            challenge_duration: 100,
            outcome: Outcome::allocation(Address([9; 20]), items),
            app_data: vec![],
            funding,
        }
    }

    #[tokio::test]
    async fn proposal_goes_to_every_peer() {
        let s = signers(3);
        let (engine, sent) = engine(s[1].clone(), Arc::new(MemoryChain::new()));
        let id = engine.create_channel(params(&s, FundingStrategy::Fake)).await.unwrap();

        let sent = sent.0.lock();
        let mut recipients: Vec<&str> = sent.iter().map(|m| m.recipient.as_str()).collect();
        recipients.sort_unstable();
        assert_eq!(recipients, ["p0", "p2"]);
        for m in sent.iter() {
            assert_eq!(m.sender, "p1");
            assert_eq!(m.payload.objectives.len(), 1);
            assert_eq!(m.payload.signed_states[0].state.turn_num, 0);
        }
        let objective = engine.get_objective(&ObjectiveId::open_channel(id)).unwrap();
        assert_eq!(objective.status(), &ObjectiveStatus::Approved);
    }

    #[tokio::test]
    async fn nonces_are_not_reused() {
        let s = signers(2);
        let (engine, _) = engine(s[0].clone(), Arc::new(MemoryChain::new()));
        let a = engine.create_channel(params(&s, FundingStrategy::Fake)).await.unwrap();
        let b = engine.create_channel(params(&s, FundingStrategy::Fake)).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn outsiders_cannot_create_channels() {
        let s = signers(3);
        let (engine, sent) = engine(s[2].clone(), Arc::new(MemoryChain::new()));
        assert!(matches!(
            engine.create_channel(params(&s[..2], FundingStrategy::Fake)).await,
            Err(EngineError::NotAParticipant(_))
        ));
        assert!(matches!(
            engine
                .create_channel(params(
                    &s,
                    FundingStrategy::Ledger {
                        ledger_channel_id: Default::default()
                    }
                ))
                .await,
            Err(EngineError::UnknownChannel(_))
        ));
        assert!(sent.0.lock().is_empty());
    }

    #[tokio::test]
    async fn incompatible_versions_are_refused() {
        let s = signers(2);
        let (engine, _) = engine(s[0].clone(), Arc::new(MemoryChain::new()));
        let msg = Message {
            sender: "p1".into(),
            recipient: "p0".into(),
            payload: Payload::new("channel-engine/1.0"),
        };
        assert!(matches!(
            engine.push_message(msg).await,
            Err(EngineError::IncompatibleVersion { .. })
        ));
    }

    #[tokio::test]
    async fn bad_states_are_rejected_back() {
        let s = signers(2);
        let (engine, sent) = engine(s[0].clone(), Arc::new(MemoryChain::new()));
        let constants = Arc::new(crate::channel::test_util::constants(&s, NULL_APP));
        let prefund = State::prefund(constants, Outcome::default(), vec![]);
        let mut signed = prefund.sign(&s[1]).unwrap();
        signed.signatures.push(signed.signatures[0]);

        let mut payload = Payload::new("channel-engine/0.3");
        payload.signed_states.push(signed);
        let msg = Message {
            sender: "p1".into(),
            recipient: "p0".into(),
            payload,
        };
        engine.push_message(msg).await.unwrap();

        let sent = sent.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "p1");
        assert_eq!(sent[0].payload.rejections.len(), 1);
        assert_eq!(sent[0].payload.rejections[0].turn_num, 0);
    }

    fn announce(request: LedgerRequest) -> Message {
        let mut payload = Payload::new("channel-engine/0.3");
        payload.ledger_requests.push(request);
        Message {
            sender: "p1".into(),
            recipient: "p0".into(),
            payload,
        }
    }

    #[tokio::test]
    async fn ledger_requests_must_ask_for_our_amounts() {
        let s = signers(2);
        let (engine, sent) = engine(s[0].clone(), Arc::new(MemoryChain::new()));
        let ledger = State::prefund(
            Arc::new(crate::channel::test_util::constants(&s, CONSENSUS_APP)),
            params(&s, FundingStrategy::Fake).outcome,
            vec![],
        );
        let ledger_id = ledger.channel_id();
        engine.store().add_signed_state(&ledger.sign(&s[0]).unwrap()).unwrap();
        let funding = FundingStrategy::Ledger {
            ledger_channel_id: ledger_id,
        };
        let id = engine.create_channel(params(&s, funding)).await.unwrap();
        sent.0.lock().clear();

        // The channel holds 5 of each, the peer wants all of it from us.
        let greedy = LedgerRequest::new(ledger_id, RequestKind::Fund, id, Address([9; 20]), vec![10.into(), 0.into()]);
        engine.push_message(announce(greedy)).await.unwrap();
        {
            let sent = sent.0.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].recipient, "p1");
            let rejection = &sent[0].payload.rejections[0];
            assert_eq!(rejection.channel_id, ledger_id);
            assert!(rejection.reason.contains("does not match"), "{}", rejection.reason);
        }
        assert!(engine.ledger_requests(ledger_id).is_empty());

        sent.0.lock().clear();
        let fair = LedgerRequest::new(ledger_id, RequestKind::Fund, id, Address([9; 20]), vec![5.into(), 5.into()]);
        engine.push_message(announce(fair)).await.unwrap();
        assert!(sent.0.lock().iter().all(|m| m.payload.rejections.is_empty()));
        let queued = engine.ledger_requests(ledger_id);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].amounts, vec![U256::from(5), U256::from(5)]);

        // Once queued, other terms for the same channel are refused too.
        sent.0.lock().clear();
        let greedy = LedgerRequest::new(ledger_id, RequestKind::Fund, id, Address([9; 20]), vec![10.into(), 0.into()]);
        engine.push_message(announce(greedy)).await.unwrap();
        assert_eq!(sent.0.lock()[0].payload.rejections.len(), 1);
        assert_eq!(engine.ledger_requests(ledger_id)[0].amounts, vec![U256::from(5), U256::from(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_objectives_stall() {
        let s = signers(2);
        let (engine, _) = engine(s[0].clone(), Arc::new(MemoryChain::new()));
        let id = engine.create_channel(params(&s, FundingStrategy::Fake)).await.unwrap();
        assert!(engine.stalled_objectives().is_empty());

        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert_eq!(engine.stalled_objectives(), vec![ObjectiveId::open_channel(id)]);

        engine
            .cancel_objective(&ObjectiveId::open_channel(id), "peer went away")
            .unwrap();
        assert!(engine.stalled_objectives().is_empty());
        assert_eq!(
            engine.get_objective(&ObjectiveId::open_channel(id)).unwrap().status(),
            &ObjectiveStatus::Failed("cancelled: peer went away".into())
        );
    }
}
