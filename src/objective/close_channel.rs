use super::{
    ledger_request, track_ledger_request, CrankContext, FundingStrategy, ObjectiveEffect,
    ObjectiveError, Step,
};
use crate::{
    channel::ChannelId,
    ledger::{LedgerRequest, RequestKind},
    store::SignedStateStore,
};
use tracing::debug;

/// Closes a channel: agree on a final state, then get the funds out of the
/// channel the way they came in.
#[derive(Debug, Clone)]
pub struct CloseChannel {
    channel_id: ChannelId,
    funding: FundingStrategy,
    watching: bool,
    concluded: bool,
}

impl CloseChannel {
    pub fn new(channel_id: ChannelId, funding: FundingStrategy) -> Self {
        Self {
            channel_id,
            funding,
            watching: false,
            concluded: false,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn funding(&self) -> FundingStrategy {
        self.funding
    }

    pub(super) fn retry_conclude(&mut self) {
        self.concluded = false;
    }

    /// Request returning the amounts of the supported final state.
    pub fn ledger_request(&self, store: &SignedStateStore) -> Result<Option<LedgerRequest>, ObjectiveError> {
        let ledger_channel_id = match self.funding {
            FundingStrategy::Ledger { ledger_channel_id } => ledger_channel_id,
            _ => return Ok(None),
        };
        let supported = match store.supported_state(self.channel_id) {
            Some(s) if s.state.is_final => s.state,
            _ => return Ok(None),
        };
        let ledger = store
            .constants(ledger_channel_id)
            .ok_or(ObjectiveError::UnknownChannel(ledger_channel_id))?;
        ledger_request(
            &ledger,
            &supported.constants,
            &supported.outcome,
            RequestKind::Defund,
        )
        .map(Some)
    }

    pub(super) fn crank(&mut self, ctx: &CrankContext<'_>) -> Result<Step, ObjectiveError> {
        let id = self.channel_id;
        let constants = ctx
            .store
            .constants(id)
            .ok_or(ObjectiveError::UnknownChannel(id))?;
        let me = constants
            .index_of(ctx.signer.address())
            .ok_or(ObjectiveError::NotAParticipant(id))?;
        let supported = ctx
            .store
            .supported_state(id)
            .ok_or(ObjectiveError::NotSupported(id))?;
        let mut effects = Vec::new();

        if !supported.state.is_final {
            // The final state keeps the supported outcome. Anything else at
            // that turn is not ours to sign.
            let final_state = supported.state.make_final_state();
            if let Some(other) = ctx.store.signed_state(id, final_state.turn_num) {
                if other.state != final_state {
                    return Err(ObjectiveError::ConflictingFinalState {
                        channel_id: id,
                        turn_num: final_state.turn_num,
                    });
                }
            }
            if !ctx.store.has_signed(id, final_state.turn_num, me) {
                debug!(channel_id = ?id, turn_num = final_state.turn_num, "signing final state");
                effects.push(ObjectiveEffect::SendSignedState(
                    ctx.store.sign_and_add(&final_state, ctx.signer)?,
                ));
            }
            return Ok(Step::Waiting(effects));
        }

        match self.funding {
            FundingStrategy::Fake => Ok(Step::Succeeded(effects)),
            FundingStrategy::Ledger { .. } => {
                let done = match self.ledger_request(ctx.store)? {
                    Some(request) => track_ledger_request(ctx, request, &mut effects)?,
                    None => false,
                };
                if done {
                    Ok(Step::Succeeded(effects))
                } else {
                    Ok(Step::Waiting(effects))
                }
            }
            FundingStrategy::Direct => {
                if !self.watching {
                    self.watching = true;
                    effects.push(ObjectiveEffect::WatchChannel(id));
                }
                let chain = match ctx.chain {
                    Some(c) => c,
                    None => return Ok(Step::Waiting(effects)),
                };
                if supported
                    .state
                    .outcome
                    .asset_holders()
                    .all(|h| chain.holding(h).is_zero())
                {
                    return Ok(Step::Succeeded(effects));
                }
                if !self.concluded {
                    self.concluded = true;
                    effects.push(ObjectiveEffect::ConcludeAndWithdraw(supported));
                }
                Ok(Step::Waiting(effects))
            }
        }
    }
}
