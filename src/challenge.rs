//! Dispute/Challenge Coordinator.
//!
//! [ChallengeState::transition] is the whole protocol: a pure function from
//! the current state and an event to the next state plus the effects the
//! driver has to carry out. [ChallengeCoordinator] performs those effects
//! against a [ChainService] and feeds their results back in as events.

use crate::{
    abiencode::types::Signature,
    chain::{ChainError, ChainService, ChainUpdate, TxHash},
    channel::SignedState,
    config::RetryConfig,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// The response window elapsed, the challenged state is final.
    Finalized,
    /// A counterparty answered with a newer state.
    Responded { turn_num_record: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeState {
    Init,
    SubmitTransaction {
        attempt: u32,
    },
    WaitMining {
        tx: TxHash,
        attempt: u32,
    },
    /// The last submission failed transiently, waiting for the backoff.
    Retry {
        attempt: u32,
        reason: String,
    },
    WaitForResponseOrTimeout {
        turn_num_record: u64,
        finalizes_at: u64,
    },
    Done(ChallengeOutcome),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeEvent {
    ChainUpdated(ChainUpdate),
    Submitted(TxHash),
    SubmissionFailed(ChainError),
    Mined,
    MiningFailed(ChainError),
    RetryApproved,
    /// The response window plus grace period elapsed without news.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeEffect {
    SubmitChallenge,
    WaitForTransaction(TxHash),
    ScheduleRetry { delay: Duration },
}

impl ChallengeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeState::Done(_) | ChallengeState::Failure(_))
    }

    /// Next state for `event`, given that we challenge with a state at
    /// `challenged_turn`. Events that do not apply leave the state as is.
    pub fn transition(
        self,
        event: ChallengeEvent,
        challenged_turn: u64,
        policy: &RetryConfig,
    ) -> (ChallengeState, Vec<ChallengeEffect>) {
        use ChallengeEffect as Fx;
        use ChallengeEvent as Ev;
        use ChallengeState as St;

        if self.is_terminal() {
            return (self, Vec::new());
        }
        if let Ev::ChainUpdated(u) = &event {
            if u.finalized {
                return (St::Done(ChallengeOutcome::Finalized), Vec::new());
            }
        }

        match (self, event) {
            (St::Init, Ev::ChainUpdated(u)) => {
                if u.challenge_registered() {
                    // Someone challenged already, racing them would revert.
                    (
                        St::WaitForResponseOrTimeout {
                            turn_num_record: u.turn_num_record,
                            finalizes_at: u.finalizes_at,
                        },
                        Vec::new(),
                    )
                } else {
                    (St::SubmitTransaction { attempt: 1 }, vec![Fx::SubmitChallenge])
                }
            }
            (St::SubmitTransaction { attempt }, Ev::Submitted(tx)) => (
                St::WaitMining { tx, attempt },
                vec![Fx::WaitForTransaction(tx)],
            ),
            (St::SubmitTransaction { attempt }, Ev::SubmissionFailed(e))
            | (St::WaitMining { attempt, .. }, Ev::MiningFailed(e)) => {
                if !e.is_transient() {
                    (St::Failure(e.to_string()), Vec::new())
                } else if attempt >= policy.max_attempts {
                    (
                        St::Failure(format!("giving up after {} attempts: {}", attempt, e)),
                        Vec::new(),
                    )
                } else {
                    (
                        St::Retry {
                            attempt,
                            reason: e.to_string(),
                        },
                        vec![Fx::ScheduleRetry {
                            delay: policy.backoff(attempt),
                        }],
                    )
                }
            }
            (St::Retry { attempt, .. }, Ev::RetryApproved) => (
                St::SubmitTransaction {
                    attempt: attempt + 1,
                },
                vec![Fx::SubmitChallenge],
            ),
            (St::WaitMining { .. }, Ev::Mined) => (
                St::WaitForResponseOrTimeout {
                    turn_num_record: challenged_turn,
                    finalizes_at: 0,
                },
                Vec::new(),
            ),
            (
                St::WaitForResponseOrTimeout {
                    turn_num_record,
                    finalizes_at,
                },
                Ev::ChainUpdated(u),
            ) => {
                if !u.challenge_registered() && u.turn_num_record > turn_num_record {
                    (
                        St::Done(ChallengeOutcome::Responded {
                            turn_num_record: u.turn_num_record,
                        }),
                        Vec::new(),
                    )
                } else if u.challenge_registered() {
                    (
                        St::WaitForResponseOrTimeout {
                            turn_num_record: u.turn_num_record,
                            finalizes_at: u.finalizes_at,
                        },
                        Vec::new(),
                    )
                } else {
                    (
                        St::WaitForResponseOrTimeout {
                            turn_num_record,
                            finalizes_at,
                        },
                        Vec::new(),
                    )
                }
            }
            (St::WaitForResponseOrTimeout { .. }, Ev::Timeout) => {
                (St::Done(ChallengeOutcome::Finalized), Vec::new())
            }
            (state, _) => (state, Vec::new()),
        }
    }
}

/// Drives a [ChallengeState] to a terminal state.
#[derive(Debug)]
pub struct ChallengeCoordinator {
    chain: Arc<dyn ChainService>,
    policy: RetryConfig,
}

impl ChallengeCoordinator {
    pub fn new(chain: Arc<dyn ChainService>, policy: RetryConfig) -> Self {
        Self { chain, policy }
    }

    /// Challenges with `candidate`, a supported state, and returns once the
    /// challenge is resolved. `challenger_signature` must sign
    /// [crate::channel::challenge_message] for the candidate.
    pub async fn run(&self, candidate: SignedState, challenger_signature: Signature) -> ChallengeState {
        let channel_id = candidate.state.channel_id();
        let challenged_turn = candidate.state.turn_num;

        let mut feed = match self.chain.chain_updated_feed(channel_id).await {
            Ok(feed) => feed,
            Err(e) => return ChallengeState::Failure(format!("cannot watch the channel: {}", e)),
        };
        let mut state = ChallengeState::Init;
        let mut block_timestamp = 0;
        let mut pending: Vec<ChallengeEffect> = Vec::new();

        loop {
            let event = match pending.pop() {
                Some(effect) => self.perform(effect, &candidate, challenger_signature).await,
                None => match self
                    .next_chain_event(&mut feed, &state, block_timestamp)
                    .await
                {
                    Some(event) => event,
                    None => {
                        state = ChallengeState::Failure("chain feed closed".into());
                        break;
                    }
                },
            };
            if let ChallengeEvent::ChainUpdated(u) = &event {
                block_timestamp = u.block_timestamp;
            }

            let (next, effects) = state.clone().transition(event, challenged_turn, &self.policy);
            if next != state {
                debug!(channel_id = ?channel_id, from = ?state, to = ?next, "challenge state changed");
            }
            state = next;
            pending.extend(effects);
            if state.is_terminal() {
                break;
            }
        }

        match &state {
            ChallengeState::Done(outcome) => {
                info!(channel_id = ?channel_id, ?outcome, "challenge resolved")
            }
            ChallengeState::Failure(reason) => {
                error!(channel_id = ?channel_id, %reason, "challenge failed")
            }
            _ => {}
        }
        state
    }

    async fn perform(
        &self,
        effect: ChallengeEffect,
        candidate: &SignedState,
        challenger_signature: Signature,
    ) -> ChallengeEvent {
        match effect {
            ChallengeEffect::SubmitChallenge => {
                match self.chain.challenge(candidate.clone(), challenger_signature).await {
                    Ok(tx) => ChallengeEvent::Submitted(tx),
                    Err(e) => {
                        warn!(channel_id = ?candidate.state.channel_id(), error = %e, "challenge submission failed");
                        ChallengeEvent::SubmissionFailed(e)
                    }
                }
            }
            ChallengeEffect::WaitForTransaction(tx) => {
                match time::timeout(self.policy.mining_timeout(), self.chain.wait_for_transaction(tx)).await {
                    Ok(Ok(())) => ChallengeEvent::Mined,
                    Ok(Err(e)) => ChallengeEvent::MiningFailed(e),
                    Err(_) => ChallengeEvent::MiningFailed(ChainError::Transient(format!(
                        "transaction {} not mined in time",
                        tx
                    ))),
                }
            }
            ChallengeEffect::ScheduleRetry { delay } => {
                time::sleep(delay).await;
                ChallengeEvent::RetryApproved
            }
        }
    }

    /// Waits for the next chain update. While a challenge is running the wait
    /// is bounded by its remaining response window.
    async fn next_chain_event(
        &self,
        feed: &mut mpsc::Receiver<ChainUpdate>,
        state: &ChallengeState,
        block_timestamp: u64,
    ) -> Option<ChallengeEvent> {
        let deadline = match state {
            ChallengeState::WaitForResponseOrTimeout { finalizes_at, .. } if *finalizes_at > 0 => {
                let remaining = finalizes_at.saturating_sub(block_timestamp);
                Some(Duration::from_secs(remaining) + self.policy.response_grace())
            }
            _ => None,
        };
        match deadline {
            Some(deadline) => match time::timeout(deadline, feed.recv()).await {
                Ok(update) => update.map(ChallengeEvent::ChainUpdated),
                Err(_) => Some(ChallengeEvent::Timeout),
            },
            None => feed.recv().await.map(ChallengeEvent::ChainUpdated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abiencode::types::Address,
        chain::{AssetHolding, MemoryChain},
        channel::{challenge_message, test_util::*, AllocationItem, Outcome, State},
        sig::Signer,
    };

    fn update(turn_num_record: u64, finalizes_at: u64, finalized: bool) -> ChainUpdate {
        ChainUpdate {
            channel_id: Default::default(),
            holdings: vec![AssetHolding {
                asset_holder: Address([9; 20]),
                amount: 10.into(),
            }],
            turn_num_record,
            finalizes_at,
            finalized,
            block_timestamp: 50,
        }
    }

    fn policy() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            backoff_ms: 1,
            mining_timeout_ms: 1_000,
            response_grace_ms: 1_000,
        }
    }

    #[test]
    fn stuck_channel_is_finalized() {
        let p = policy();
        let (s, fx) = ChallengeState::Init.transition(ChallengeEvent::ChainUpdated(update(0, 0, false)), 4, &p);
        assert_eq!(s, ChallengeState::SubmitTransaction { attempt: 1 });
        assert_eq!(fx, vec![ChallengeEffect::SubmitChallenge]);

        let tx = Default::default();
        let (s, fx) = s.transition(ChallengeEvent::Submitted(tx), 4, &p);
        assert_eq!(fx, vec![ChallengeEffect::WaitForTransaction(tx)]);
        let (s, _) = s.transition(ChallengeEvent::Mined, 4, &p);
        let (s, _) = s.transition(ChallengeEvent::ChainUpdated(update(4, 150, false)), 4, &p);
        assert_eq!(
            s,
            ChallengeState::WaitForResponseOrTimeout {
                turn_num_record: 4,
                finalizes_at: 150
            }
        );
        let (s, _) = s.transition(ChallengeEvent::ChainUpdated(update(4, 150, true)), 4, &p);
        assert_eq!(s, ChallengeState::Done(ChallengeOutcome::Finalized));

        // Terminal states stay put.
        let (s, fx) = s.transition(ChallengeEvent::RetryApproved, 4, &p);
        assert_eq!(s, ChallengeState::Done(ChallengeOutcome::Finalized));
        assert!(fx.is_empty());
    }

    #[test]
    fn registered_challenge_is_not_raced() {
        let (s, fx) = ChallengeState::Init.transition(
            ChallengeEvent::ChainUpdated(update(6, 150, false)),
            4,
            &policy(),
        );
        assert!(fx.is_empty());
        assert_eq!(
            s,
            ChallengeState::WaitForResponseOrTimeout {
                turn_num_record: 6,
                finalizes_at: 150
            }
        );
        let (s, _) = s.transition(ChallengeEvent::Timeout, 4, &policy());
        assert_eq!(s, ChallengeState::Done(ChallengeOutcome::Finalized));
    }

    #[test]
    fn retries_are_bounded() {
        let p = policy();
        let transient = || ChallengeEvent::SubmissionFailed(ChainError::Transient("gas".into()));
        let mut state = ChallengeState::SubmitTransaction { attempt: 1 };
        for attempt in 1..p.max_attempts {
            let (s, fx) = state.transition(transient(), 4, &p);
            assert_eq!(
                fx,
                vec![ChallengeEffect::ScheduleRetry {
                    delay: p.backoff(attempt)
                }]
            );
            let (s, fx) = s.transition(ChallengeEvent::RetryApproved, 4, &p);
            assert_eq!(fx, vec![ChallengeEffect::SubmitChallenge]);
            state = s;
        }
        let (s, _) = state.transition(transient(), 4, &p);
        assert!(matches!(s, ChallengeState::Failure(reason) if reason.contains("3 attempts")));

        let (s, _) = ChallengeState::SubmitTransaction { attempt: 1 }.transition(
            ChallengeEvent::SubmissionFailed(ChainError::Reverted("stale".into())),
            4,
            &p,
        );
        assert!(matches!(s, ChallengeState::Failure(_)));
    }

    fn stuck_channel(signers: &[Signer]) -> (SignedState, Signature) {
        let c = std::sync::Arc::new(constants(signers, Address::default()));
        let items = c
            .participants()
            .iter()
            .map(|p| AllocationItem::new(p.destination, 5.into()))
            .collect();
        let mut state = State::prefund(c, Outcome::allocation(Address([9; 20]), items), vec![]);
        state.turn_num = 4;
        let mut signed = state.sign(&signers[0]).unwrap();
        signed.add_signature(&signers[1]).unwrap();
        let sig = signers[0]
            .sign_eth(challenge_message(state.channel_id(), 4).unwrap())
            .unwrap();
        (signed, sig)
    }

    async fn until_registered(chain: &MemoryChain, id: crate::channel::ChannelId) {
        while !chain.status(id).challenge_registered() {
            time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn coordinator_waits_for_finalization() {
        let s = signers(2);
        let chain = Arc::new(MemoryChain::new());
        let (candidate, sig) = stuck_channel(&s);
        let id = candidate.state.channel_id();
        chain.register_channel(id).await.unwrap();
        chain.fail_next(ChainError::Transient("nonce too low".into()));

        let coordinator = ChallengeCoordinator::new(chain.clone(), policy());
        let run = tokio::spawn(async move { coordinator.run(candidate, sig).await });
        until_registered(&chain, id).await;
        chain.advance_time(100);

        assert_eq!(run.await.unwrap(), ChallengeState::Done(ChallengeOutcome::Finalized));
    }

    #[tokio::test]
    async fn coordinator_sees_the_response() {
        let s = signers(2);
        let chain = Arc::new(MemoryChain::new());
        let (candidate, sig) = stuck_channel(&s);
        let id = candidate.state.channel_id();
        chain.register_channel(id).await.unwrap();

        let newer = candidate.state.make_next_state();
        let mut response = newer.sign(&s[1]).unwrap();
        response.add_signature(&s[0]).unwrap();

        let coordinator = ChallengeCoordinator::new(chain.clone(), policy());
        let run = tokio::spawn(async move { coordinator.run(candidate, sig).await });
        until_registered(&chain, id).await;
        chain.respond(response).unwrap();

        assert_eq!(
            run.await.unwrap(),
            ChallengeState::Done(ChallengeOutcome::Responded { turn_num_record: 5 })
        );
    }

    #[tokio::test]
    async fn reverts_are_fatal() {
        let s = signers(2);
        let chain = Arc::new(MemoryChain::new());
        let (candidate, sig) = stuck_channel(&s);
        chain.register_channel(candidate.state.channel_id()).await.unwrap();
        chain.fail_next(ChainError::Reverted("bad signature".into()));

        let state = ChallengeCoordinator::new(chain, policy()).run(candidate, sig).await;
        assert!(matches!(state, ChallengeState::Failure(reason) if reason.contains("bad signature")));
    }
}
