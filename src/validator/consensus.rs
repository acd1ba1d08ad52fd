//! Rules of the consensus app used by ledger channels.
//!
//! The app data of a ledger state is a [ConsensusData]. Starting from a
//! settled state (`further_votes_required == 0`) a participant may propose a
//! new outcome, which every other participant then votes on in turn. The last
//! vote moves the proposed outcome into the state's outcome. Anyone whose
//! turn it is may veto a proposal instead, or pass when nothing is proposed.

use super::TransitionError;
use crate::{
    channel::{Outcome, State},
    wire::{proto::ConsensusDataMsg, ConversionError},
};
use prost::Message;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsensusData {
    pub further_votes_required: u32,
    /// Empty when nothing is proposed.
    pub proposed_outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusMove {
    Propose,
    Vote,
    FinalVote,
    Veto,
    Pass,
}

impl ConsensusData {
    pub fn encode(&self) -> Vec<u8> {
        ConsensusDataMsg::from(self).encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConversionError> {
        ConsensusDataMsg::decode(bytes)?.try_into()
    }

    pub fn from_state(state: &State) -> Result<Self, ConversionError> {
        Self::decode(&state.app_data)
    }

    pub fn is_settled(&self) -> bool {
        self.further_votes_required == 0
    }
}

fn with_data(state: &State, data: ConsensusData) -> State {
    let mut next = state.make_next_state();
    next.app_data = data.encode();
    next
}

/// State proposing `proposed` on top of the settled `state`.
pub fn propose(state: &State, proposed: Outcome) -> State {
    let n = state.constants.num_participants() as u32;
    with_data(
        state,
        ConsensusData {
            further_votes_required: n - 1,
            proposed_outcome: proposed,
        },
    )
}

/// Vote for the open proposal of `state`. The last vote applies it. A
/// settled state has nothing to vote on.
pub fn vote(state: &State) -> Result<State, TransitionError> {
    let data = ConsensusData::from_state(state)?;
    Ok(match data.further_votes_required {
        0 => return Err(TransitionError::Consensus("nothing proposed to vote on")),
        1 => {
            let mut next = with_data(state, ConsensusData::default());
            next.outcome = data.proposed_outcome;
            next
        }
        f => with_data(
            state,
            ConsensusData {
                further_votes_required: f - 1,
                ..data
            },
        ),
    })
}

/// Reject the open proposal of `state`.
pub fn veto(state: &State) -> State {
    with_data(state, ConsensusData::default())
}

/// Let the turn go by without proposing.
pub fn pass(state: &State) -> State {
    with_data(state, ConsensusData::default())
}

/// Classifies the transition `from -> to`, failing if it is none of the
/// allowed moves. Turn numbers and channel identity are checked by the
/// caller.
pub fn validate(from: &State, to: &State) -> Result<ConsensusMove, TransitionError> {
    let n = from.constants.num_participants() as u32;
    let a = ConsensusData::from_state(from)?;
    let b = ConsensusData::from_state(to)?;
    let (f, g) = (a.further_votes_required, b.further_votes_required);

    if f >= n || g >= n {
        return Err(TransitionError::Consensus(
            "furtherVotesRequired exceeds the number of other participants",
        ));
    }

    let outcome_unchanged = from.outcome == to.outcome;

    match (f, g) {
        (0, 0) => {
            if !outcome_unchanged {
                return Err(TransitionError::Consensus("outcome changed without a vote"));
            }
            if !b.proposed_outcome.is_empty() {
                return Err(TransitionError::Consensus("a pass must not propose"));
            }
            Ok(ConsensusMove::Pass)
        }
        (0, g) if g == n - 1 => {
            if !outcome_unchanged {
                return Err(TransitionError::Consensus(
                    "a proposal must not change the outcome",
                ));
            }
            if b.proposed_outcome.is_empty() {
                return Err(TransitionError::Consensus(
                    "a proposal needs a proposed outcome",
                ));
            }
            if !from.outcome.asset_holders().eq(b.proposed_outcome.asset_holders())
                || !from.outcome.conserves(&b.proposed_outcome)
            {
                return Err(TransitionError::Consensus(
                    "the proposed outcome does not conserve the ledger funds",
                ));
            }
            Ok(ConsensusMove::Propose)
        }
        (0, _) => Err(TransitionError::Consensus(
            "a proposal must require a vote from every other participant",
        )),
        (f, 0) => {
            if !b.proposed_outcome.is_empty() {
                return Err(TransitionError::Consensus(
                    "a settled state must not carry a proposal",
                ));
            }
            if f == 1 && to.outcome == a.proposed_outcome {
                Ok(ConsensusMove::FinalVote)
            } else if outcome_unchanged {
                Ok(ConsensusMove::Veto)
            } else {
                Err(TransitionError::Consensus(
                    "the final vote must apply exactly the proposed outcome",
                ))
            }
        }
        (f, g) if g + 1 == f => {
            if !outcome_unchanged {
                return Err(TransitionError::Consensus(
                    "a vote must not change the outcome",
                ));
            }
            if a.proposed_outcome != b.proposed_outcome {
                return Err(TransitionError::Consensus(
                    "a vote must not change the proposed outcome",
                ));
            }
            Ok(ConsensusMove::Vote)
        }
        _ => Err(TransitionError::Consensus(
            "furtherVotesRequired must decrease by exactly one",
        )),
    }
}
