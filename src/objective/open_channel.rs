use super::{
    ledger_request, track_ledger_request, CrankContext, FundingStrategy, ObjectiveEffect,
    ObjectiveError, Step,
};
use crate::{
    abiencode::types::{Address, U256},
    channel::{ChannelConstants, ChannelId, PartIdx, State},
    ledger::{LedgerRequest, RequestKind},
    store::SignedStateStore,
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

/// Opens a channel: agree on the pre-fund state, fund the channel and agree
/// on the post-fund state.
#[derive(Debug, Clone)]
pub struct OpenChannel {
    constants: Arc<ChannelConstants>,
    funding: FundingStrategy,
    watching: bool,
    /// Asset holders we deposited into.
    deposited: BTreeSet<Address>,
}

impl OpenChannel {
    pub fn new(constants: Arc<ChannelConstants>, funding: FundingStrategy) -> Self {
        Self {
            constants,
            funding,
            watching: false,
            deposited: BTreeSet::new(),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.constants.id()
    }

    pub fn constants(&self) -> &ChannelConstants {
        &self.constants
    }

    pub fn funding(&self) -> FundingStrategy {
        self.funding
    }

    pub(super) fn retry_deposits(&mut self) {
        self.deposited.clear();
    }

    /// Request funding the channel with the amounts of its pre-fund state.
    pub fn ledger_request(&self, store: &SignedStateStore) -> Result<Option<LedgerRequest>, ObjectiveError> {
        let ledger_channel_id = match self.funding {
            FundingStrategy::Ledger { ledger_channel_id } => ledger_channel_id,
            _ => return Ok(None),
        };
        let prefund = match store.signed_state(self.channel_id(), 0) {
            Some(s) => s.state,
            None => return Ok(None),
        };
        let ledger = store
            .constants(ledger_channel_id)
            .ok_or(ObjectiveError::UnknownChannel(ledger_channel_id))?;
        ledger_request(&ledger, &self.constants, &prefund.outcome, RequestKind::Fund).map(Some)
    }

    pub(super) fn crank(&mut self, ctx: &CrankContext<'_>) -> Result<Step, ObjectiveError> {
        let id = self.channel_id();
        let post_fund = self.constants.post_fund_turn();
        let me = self
            .constants
            .index_of(ctx.signer.address())
            .ok_or(ObjectiveError::NotAParticipant(id))?;
        let mut effects = Vec::new();

        if supported_turn(ctx, id).map_or(false, |t| t >= post_fund) {
            return Ok(Step::Succeeded(effects));
        }
        if ctx.chain.map_or(false, |c| c.finalized) {
            return Err(ObjectiveError::FinalizedOnChain(id));
        }

        let prefund = match ctx.store.signed_state(id, 0) {
            Some(s) => s.state,
            None => return Ok(Step::Waiting(effects)),
        };
        if !ctx.store.has_signed(id, 0, me) {
            debug!(channel_id = ?id, "signing pre-fund state");
            effects.push(ObjectiveEffect::SendSignedState(
                ctx.store.sign_and_add(&prefund, ctx.signer)?,
            ));
        }
        if supported_turn(ctx, id).is_none() {
            return Ok(Step::Waiting(effects));
        }

        if !ctx.store.has_signed(id, post_fund, me) {
            if !self.funding_complete(ctx, me, &prefund, &mut effects)? {
                return Ok(Step::Waiting(effects));
            }
            debug!(channel_id = ?id, "funded, signing post-fund state");
            effects.push(ObjectiveEffect::SendSignedState(
                ctx.store.sign_and_add(&prefund.make_postfund_state(), ctx.signer)?,
            ));
        }

        if supported_turn(ctx, id).map_or(false, |t| t >= post_fund) {
            Ok(Step::Succeeded(effects))
        } else {
            Ok(Step::Waiting(effects))
        }
    }

    fn funding_complete(
        &mut self,
        ctx: &CrankContext<'_>,
        me: PartIdx,
        prefund: &State,
        effects: &mut Vec<ObjectiveEffect>,
    ) -> Result<bool, ObjectiveError> {
        match self.funding {
            FundingStrategy::Fake => Ok(true),
            FundingStrategy::Ledger { .. } => match self.ledger_request(ctx.store)? {
                Some(request) => track_ledger_request(ctx, request, effects),
                None => Ok(false),
            },
            FundingStrategy::Direct => {
                if !self.watching {
                    self.watching = true;
                    effects.push(ObjectiveEffect::WatchChannel(self.channel_id()));
                }
                let chain = match ctx.chain {
                    Some(c) => c,
                    None => return Ok(false),
                };
                let outcome = &prefund.outcome;
                let participants = self.constants.participants();
                let mut complete = true;
                for holder in outcome.asset_holders() {
                    let total = outcome.total_for(holder).ok_or(ObjectiveError::Overflow)?;
                    let held = chain.holding(holder);
                    if held >= total {
                        continue;
                    }
                    complete = false;

                    // Deposits happen in participant order, ours once the
                    // ones before us are in.
                    let expected_held = participants[..me]
                        .iter()
                        .try_fold(U256::zero(), |acc, p| {
                            acc.checked_add(outcome.amount_for(holder, p.destination))
                        })
                        .ok_or(ObjectiveError::Overflow)?;
                    let amount = outcome.amount_for(holder, participants[me].destination);
                    if amount.is_zero() || held < expected_held {
                        continue;
                    }
                    let ours_in = expected_held
                        .checked_add(amount)
                        .map_or(true, |covered| held >= covered);
                    if !ours_in && self.deposited.insert(holder) {
                        effects.push(ObjectiveEffect::Deposit {
                            channel_id: self.channel_id(),
                            asset_holder: holder,
                            expected_held,
                            amount,
                        });
                    }
                }
                Ok(complete)
            }
        }
    }
}

fn supported_turn(ctx: &CrankContext<'_>, id: ChannelId) -> Option<u64> {
    ctx.store.supported_state(id).map(|s| s.state.turn_num)
}

#[cfg(test)]
mod tests {
    use super::super::{test_util::*, Objective, ObjectiveKind, ObjectiveStatus};
    use super::*;
    use crate::{
        chain::{AssetHolding, ChainUpdate},
        ledger::RequestStatus,
        validator::{CONSENSUS_APP, NULL_APP},
    };

    fn open(pre: &State, funding: FundingStrategy) -> Objective {
        Objective::new(
            ObjectiveKind::OpenChannel(OpenChannel::new(pre.constants.clone(), funding)),
            ObjectiveStatus::Approved,
        )
    }

    fn holding(id: ChannelId, amount: u64) -> ChainUpdate {
        ChainUpdate {
            channel_id: id,
            holdings: vec![AssetHolding {
                asset_holder: HOLDER,
                amount: amount.into(),
            }],
            turn_num_record: 0,
            finalizes_at: 0,
            finalized: false,
            block_timestamp: 0,
        }
    }

    #[test]
    fn fake_funding_opens_right_away() {
        let parties = parties(2);
        let pre = prefund(&parties, NULL_APP, &[5, 5]);
        let mut objectives = [open(&pre, FundingStrategy::Fake), open(&pre, FundingStrategy::Fake)];
        deliver(&parties, &[ObjectiveEffect::SendSignedState(pre.sign(&parties[0].signer).unwrap())]);

        // Until nothing changes, like the engine does.
        loop {
            let mut effects = Vec::new();
            for (o, p) in objectives.iter_mut().zip(&parties) {
                effects.extend(o.crank(&p.ctx(None)));
            }
            if effects.is_empty() {
                break;
            }
            deliver(&parties, &effects);
        }
        for o in &objectives {
            assert_eq!(o.status(), &ObjectiveStatus::Succeeded);
        }
        let supported = parties[1].store.supported_state(pre.channel_id()).unwrap();
        assert!(supported.state.is_postfund());
    }

    #[test]
    fn deposits_wait_for_earlier_participants() {
        let parties = parties(2);
        let pre = prefund(&parties, NULL_APP, &[5, 7]);
        let id = pre.channel_id();
        deliver(&parties, &[ObjectiveEffect::SendSignedState(pre.sign(&parties[0].signer).unwrap())]);
        let mut second = open(&pre, FundingStrategy::Direct);
        let effects = second.crank(&parties[1].ctx(None));
        assert!(effects.contains(&ObjectiveEffect::WatchChannel(id)));
        deliver(&parties, &effects);

        // Participant 0 has not deposited yet.
        assert!(second.crank(&parties[1].ctx(Some(&holding(id, 0)))).is_empty());

        let effects = second.crank(&parties[1].ctx(Some(&holding(id, 5))));
        assert_eq!(
            effects,
            vec![ObjectiveEffect::Deposit {
                channel_id: id,
                asset_holder: HOLDER,
                expected_held: 5.into(),
                amount: 7.into(),
            }]
        );
        // Not submitted twice while the deposit is in flight.
        assert!(second.crank(&parties[1].ctx(Some(&holding(id, 5)))).is_empty());

        let effects = second.crank(&parties[1].ctx(Some(&holding(id, 12))));
        assert!(matches!(
            effects.as_slice(),
            [ObjectiveEffect::SendSignedState(s)] if s.state.is_postfund()
        ));
        assert_eq!(second.status(), &ObjectiveStatus::Approved);
    }

    #[test]
    fn failed_deposit_is_resubmitted() {
        let parties = parties(2);
        let pre = prefund(&parties, NULL_APP, &[5, 7]);
        let id = pre.channel_id();
        deliver(&parties, &[ObjectiveEffect::SendSignedState(pre.sign(&parties[1].signer).unwrap())]);
        let mut first = open(&pre, FundingStrategy::Direct);
        deliver(&parties, &first.crank(&parties[0].ctx(None)));

        let chain = holding(id, 0);
        assert_eq!(first.crank(&parties[0].ctx(Some(&chain))).len(), 1);
        first.chain_call_failed(&crate::chain::ChainError::Transient("timeout".into()));
        assert_eq!(first.crank(&parties[0].ctx(Some(&chain))).len(), 1);
        assert_eq!(first.status(), &ObjectiveStatus::Approved);
    }

    #[test]
    fn finalized_channel_fails_the_open() {
        let parties = parties(2);
        let pre = prefund(&parties, NULL_APP, &[5, 7]);
        let mut first = open(&pre, FundingStrategy::Direct);
        let mut chain = holding(pre.channel_id(), 0);
        chain.finalized = true;
        assert!(first.crank(&parties[0].ctx(Some(&chain))).is_empty());
        assert!(matches!(first.status(), ObjectiveStatus::Failed(_)));
    }

    #[test]
    fn ledger_funding_waits_for_the_request() {
        let parties = parties(2);
        let ledger = prefund(&parties, CONSENSUS_APP, &[10, 10]);
        for p in &parties {
            p.store.add_signed_state(&ledger.sign(&p.signer).unwrap()).unwrap();
        }
        let pre = prefund(&parties, NULL_APP, &[3, 4]);
        let pre = State {
            constants: Arc::new(
                ChannelConstants::new(
                    1.into(),
                    pre.constants.participants().to_vec(),
                    8,
                    NULL_APP,
                    100,
                )
                .unwrap(),
            ),
            ..pre
        };
        deliver(&parties, &[ObjectiveEffect::SendSignedState(pre.sign(&parties[0].signer).unwrap())]);
        let mut first = open(
            &pre,
            FundingStrategy::Ledger {
                ledger_channel_id: ledger.channel_id(),
            },
        );
        // Our pre-fund signature is in, the other one is missing: nothing
        // is requested yet.
        let mut effects = first.crank(&parties[0].ctx(None));
        assert!(effects.is_empty());
        assert!(parties[0].funder.requests(ledger.channel_id()).is_empty());
        parties[1]
            .store
            .sign_and_add(&pre, &parties[1].signer)
            .and_then(|s| parties[0].store.add_signed_state(&s))
            .unwrap();

        effects = first.crank(&parties[0].ctx(None));
        let request = match effects.as_slice() {
            [ObjectiveEffect::SendLedgerRequest(r)] => r.clone(),
            other => panic!("unexpected effects {:?}", other),
        };
        assert_eq!(request.amounts, vec![3.into(), 4.into()]);
        assert!(first.crank(&parties[0].ctx(None)).is_empty());

        parties[0]
            .funder
            .cancel(&request.key(), "ledger ran dry".into());
        first.crank(&parties[0].ctx(None));
        assert_eq!(
            first.status(),
            &ObjectiveStatus::Failed("funding failed: ledger ran dry".into())
        );
        assert_eq!(
            parties[0].funder.request(&request.key()).unwrap().status,
            RequestStatus::Cancelled("ledger ran dry".into())
        );
    }
}
