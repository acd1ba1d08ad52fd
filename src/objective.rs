//! Objective Engine: multi-step goals pursued together with the other
//! participants of a channel.
//!
//! An objective is cranked whenever something it may be waiting for
//! changes. Each crank signs what can be signed right away and returns the
//! effects the engine has to carry out: messages to send and chain calls to
//! make. Cranking is idempotent, a crank without news yields nothing.

mod close_channel;
mod open_channel;

use crate::{
    abiencode::types::{Address, U256},
    chain::{ChainError, ChainUpdate},
    channel::{AssetOutcome, ChannelConstants, ChannelError, ChannelId, Outcome, SignedState},
    ledger::{LedgerError, LedgerFunder, LedgerRequest, RequestKind},
    sig::Signer,
    store::{SignedStateStore, StoreError},
};
use core::fmt::{self, Display};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

pub use close_channel::CloseChannel;
pub use open_channel::OpenChannel;

#[derive(Debug, Error)]
pub enum ObjectiveError {
    #[error("channel {0} is unknown")]
    UnknownChannel(ChannelId),
    #[error("we are not a participant of channel {0}")]
    NotAParticipant(ChannelId),
    #[error("channel {0} has no supported state")]
    NotSupported(ChannelId),
    #[error("channel {0} was finalized on chain")]
    FinalizedOnChain(ChannelId),
    #[error("channel {channel_id} has another state at turn {turn_num}, not signing a final state")]
    ConflictingFinalState { channel_id: ChannelId, turn_num: u64 },
    #[error("funding failed: {0}")]
    Funding(String),
    #[error("amount overflow")]
    Overflow,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Derived from the objective's kind and channel, so the same goal always
/// gets the same id on every participant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectiveId(String);

impl ObjectiveId {
    pub fn open_channel(channel_id: ChannelId) -> Self {
        Self(format!("OpenChannel-{}", channel_id))
    }

    pub fn close_channel(channel_id: ChannelId) -> Self {
        Self(format!("CloseChannel-{}", channel_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectiveStatus {
    /// Proposed by someone else, waiting for the local user.
    PendingApproval,
    Approved,
    Succeeded,
    Failed(String),
}

impl ObjectiveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObjectiveStatus::Succeeded | ObjectiveStatus::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingStrategy {
    /// Every participant deposits its share on chain.
    Direct,
    /// Funds are moved out of an existing ledger channel.
    Ledger { ledger_channel_id: ChannelId },
    /// Considered funded from the start.
    Fake,
}

/// What participants tell each other to start an objective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectiveRequest {
    OpenChannel {
        constants: ChannelConstants,
        funding: FundingStrategy,
    },
    CloseChannel {
        channel_id: ChannelId,
    },
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        match self {
            ObjectiveRequest::OpenChannel { constants, .. } => ObjectiveId::open_channel(constants.id()),
            ObjectiveRequest::CloseChannel { channel_id } => ObjectiveId::close_channel(*channel_id),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        match self {
            ObjectiveRequest::OpenChannel { constants, .. } => constants.id(),
            ObjectiveRequest::CloseChannel { channel_id } => *channel_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectiveEffect {
    /// Send to the other participants of the state's channel.
    SendSignedState(SignedState),
    /// Announce to the other participants of the ledger channel.
    SendLedgerRequest(LedgerRequest),
    WatchChannel(ChannelId),
    Deposit {
        channel_id: ChannelId,
        asset_holder: Address,
        expected_held: U256,
        amount: U256,
    },
    ConcludeAndWithdraw(SignedState),
}

/// What an objective may look at and act upon while cranking.
pub struct CrankContext<'a> {
    pub store: &'a SignedStateStore,
    pub signer: &'a Signer,
    pub funder: &'a LedgerFunder,
    /// Latest known on-chain status of the objective's channel.
    pub chain: Option<&'a ChainUpdate>,
}

pub(crate) enum Step {
    Waiting(Vec<ObjectiveEffect>),
    Succeeded(Vec<ObjectiveEffect>),
}

#[derive(Debug, Clone)]
pub enum ObjectiveKind {
    OpenChannel(OpenChannel),
    CloseChannel(CloseChannel),
}

#[derive(Debug, Clone)]
pub struct Objective {
    id: ObjectiveId,
    status: ObjectiveStatus,
    kind: ObjectiveKind,
    last_progress: Instant,
}

impl Objective {
    pub fn new(kind: ObjectiveKind, status: ObjectiveStatus) -> Self {
        let id = match &kind {
            ObjectiveKind::OpenChannel(o) => ObjectiveId::open_channel(o.channel_id()),
            ObjectiveKind::CloseChannel(c) => ObjectiveId::close_channel(c.channel_id()),
        };
        Self {
            id,
            status,
            kind,
            last_progress: Instant::now(),
        }
    }

    pub fn id(&self) -> &ObjectiveId {
        &self.id
    }

    pub fn status(&self) -> &ObjectiveStatus {
        &self.status
    }

    pub fn kind(&self) -> &ObjectiveKind {
        &self.kind
    }

    pub fn channel_id(&self) -> ChannelId {
        match &self.kind {
            ObjectiveKind::OpenChannel(o) => o.channel_id(),
            ObjectiveKind::CloseChannel(c) => c.channel_id(),
        }
    }

    /// The request that lets other participants join this objective.
    pub fn request(&self) -> ObjectiveRequest {
        match &self.kind {
            ObjectiveKind::OpenChannel(o) => ObjectiveRequest::OpenChannel {
                constants: o.constants().clone(),
                funding: o.funding(),
            },
            ObjectiveKind::CloseChannel(c) => ObjectiveRequest::CloseChannel {
                channel_id: c.channel_id(),
            },
        }
    }

    /// The ledger request this objective asks for, once it is funded through
    /// a ledger channel and the amounts are known.
    pub fn ledger_request(&self, store: &SignedStateStore) -> Result<Option<LedgerRequest>, ObjectiveError> {
        match &self.kind {
            ObjectiveKind::OpenChannel(o) => o.ledger_request(store),
            ObjectiveKind::CloseChannel(c) => c.ledger_request(store),
        }
    }

    pub fn last_progress(&self) -> Instant {
        self.last_progress
    }

    pub fn touch(&mut self) {
        self.last_progress = Instant::now();
    }

    fn set_status(&mut self, status: ObjectiveStatus) {
        if self.status != status {
            info!(objective_id = %self.id, ?status, "objective status changed");
            self.status = status;
            self.touch();
        }
    }

    /// Returns whether the objective was waiting for approval.
    pub fn approve(&mut self) -> bool {
        if self.status == ObjectiveStatus::PendingApproval {
            self.set_status(ObjectiveStatus::Approved);
            true
        } else {
            false
        }
    }

    /// Fails the objective unless it already ended.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.set_status(ObjectiveStatus::Failed(reason.into()));
        }
    }

    /// Reacts to a chain call made on behalf of this objective failing.
    /// Transient failures are retried on the next crank.
    pub fn chain_call_failed(&mut self, error: &ChainError) {
        if error.is_transient() {
            match &mut self.kind {
                ObjectiveKind::OpenChannel(o) => o.retry_deposits(),
                ObjectiveKind::CloseChannel(c) => c.retry_conclude(),
            }
        } else {
            self.fail(error.to_string());
        }
    }

    /// Advances the objective as far as possible. Approved objectives only.
    pub fn crank(&mut self, ctx: &CrankContext<'_>) -> Vec<ObjectiveEffect> {
        if self.status != ObjectiveStatus::Approved {
            return Vec::new();
        }
        let step = match &mut self.kind {
            ObjectiveKind::OpenChannel(o) => o.crank(ctx),
            ObjectiveKind::CloseChannel(c) => c.crank(ctx),
        };
        let effects = match step {
            Ok(Step::Waiting(effects)) => effects,
            Ok(Step::Succeeded(effects)) => {
                self.set_status(ObjectiveStatus::Succeeded);
                effects
            }
            Err(e) => {
                self.fail(e.to_string());
                Vec::new()
            }
        };
        if !effects.is_empty() {
            self.touch();
        }
        effects
    }
}

/// The single allocation a ledger can fund from.
fn ledger_asset(outcome: &Outcome) -> Result<Address, ObjectiveError> {
    match outcome.0.as_slice() {
        [AssetOutcome::Allocation { asset_holder, .. }] => Ok(*asset_holder),
        _ => Err(ObjectiveError::Funding(
            "ledger funding needs an outcome with exactly one allocation".into(),
        )),
    }
}

/// Request moving the funds of `outcome` into (or out of) `channel`, with
/// the amounts of the channel's participants mapped onto the ledger's.
pub(crate) fn ledger_request(
    ledger: &ChannelConstants,
    channel: &ChannelConstants,
    outcome: &Outcome,
    kind: RequestKind,
) -> Result<LedgerRequest, ObjectiveError> {
    let asset_holder = ledger_asset(outcome)?;
    let amounts: Vec<U256> = ledger
        .participants()
        .iter()
        .map(|lp| {
            channel
                .participants()
                .iter()
                .find(|p| p.signing_address == lp.signing_address)
                .map(|p| outcome.amount_for(asset_holder, p.destination))
                .unwrap_or_default()
        })
        .collect();
    let mapped = amounts
        .iter()
        .try_fold(U256::zero(), |acc, a| acc.checked_add(*a))
        .ok_or(ObjectiveError::Overflow)?;
    if Some(mapped) != outcome.total_for(asset_holder) {
        return Err(ObjectiveError::Funding(
            "some of the channel's funds belong to destinations outside the ledger".into(),
        ));
    }
    Ok(LedgerRequest::new(
        ledger.id(),
        kind,
        channel.id(),
        asset_holder,
        amounts,
    ))
}

/// Enqueues `request` unless known and reports whether it succeeded. A
/// known request asking for other amounts is replaced by ours while it is
/// outstanding.
fn track_ledger_request(
    ctx: &CrankContext<'_>,
    request: LedgerRequest,
    effects: &mut Vec<ObjectiveEffect>,
) -> Result<bool, ObjectiveError> {
    use crate::ledger::RequestStatus;

    let known = match ctx.funder.request(&request.key()) {
        Some(known) => known,
        None => {
            ctx.funder.enqueue(request.clone());
            effects.push(ObjectiveEffect::SendLedgerRequest(request));
            return Ok(false);
        }
    };
    if !known.same_terms(&request) {
        if !known.status.is_outstanding() {
            return Err(ObjectiveError::Funding(format!(
                "ledger request for channel {} ended with other amounts",
                request.channel_to_be_funded
            )));
        }
        warn!(key = ?request.key(), theirs = ?known.amounts, ours = ?request.amounts, "replacing ledger request with other amounts");
        ctx.funder.replace(request.clone());
        effects.push(ObjectiveEffect::SendLedgerRequest(request));
        return Ok(false);
    }
    match known.status {
        RequestStatus::Succeeded => Ok(true),
        RequestStatus::Cancelled(reason) => Err(ObjectiveError::Funding(reason)),
        RequestStatus::Queued | RequestStatus::Pending => Ok(false),
    }
}


#[cfg(test)]
mod tests {
    use super::{test_util::*, *};
    use crate::{channel::Participant, validator::CONSENSUS_APP};

    #[test]
    fn ids_are_deterministic() {
        let id = ChannelId::default();
        let open = ObjectiveId::open_channel(id);
        assert_eq!(open, ObjectiveId::open_channel(id));
        assert!(open.as_str().starts_with("OpenChannel-0x0000"));
        assert_ne!(open, ObjectiveId::close_channel(id));
        assert_eq!(
            ObjectiveRequest::CloseChannel { channel_id: id }.id(),
            ObjectiveId::close_channel(id)
        );
    }

    #[test]
    fn ledger_amounts_follow_signing_addresses() {
        let parties = parties(3);
        let ledger = prefund(&parties[..2], CONSENSUS_APP, &[10, 10]);
        // Same two participants, listed the other way around.
        let reversed: Vec<Participant> = ledger.constants.participants().iter().rev().cloned().collect();
        let channel = ChannelConstants::new(1.into(), reversed, 9, Address::default(), 100).unwrap();
        let outcome = Outcome::allocation(
            HOLDER,
            channel
                .participants()
                .iter()
                .zip([4u64, 1])
                .map(|(p, a)| crate::channel::AllocationItem::new(p.destination, a.into()))
                .collect(),
        );
        let r = ledger_request(&ledger.constants, &channel, &outcome, RequestKind::Fund).unwrap();
        assert_eq!(r.amounts, vec![1.into(), 4.into()]);

        // A third participant's funds cannot come out of the two party ledger.
        let wide = prefund(&parties, Address::default(), &[1, 1, 1]);
        assert!(matches!(
            ledger_request(&ledger.constants, &wide.constants, &wide.outcome, RequestKind::Fund),
            Err(ObjectiveError::Funding(_))
        ));
    }

    #[test]
    fn failures_are_terminal() {
        let parties = parties(2);
        let pre = prefund(&parties, Address::default(), &[1, 1]);
        let mut objective = Objective::new(
            ObjectiveKind::OpenChannel(OpenChannel::new(pre.constants.clone(), FundingStrategy::Fake)),
            ObjectiveStatus::PendingApproval,
        );
        assert!(objective.crank(&parties[0].ctx(None)).is_empty());
        objective.chain_call_failed(&ChainError::Reverted("nope".into()));
        assert_eq!(objective.status(), &ObjectiveStatus::Failed("transaction reverted: nope".into()));
        assert!(!objective.approve());
        objective.fail("again");
        assert_eq!(objective.status(), &ObjectiveStatus::Failed("transaction reverted: nope".into()));
    }
}
