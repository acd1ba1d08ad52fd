//! Mapping between domain types and their protobuf representation.

use super::{proto::*, ConversionError};
use crate::{
    abiencode::types::{Address, Bytes32, Signature, U256},
    channel::{
        AllocationItem, AssetOutcome, ChannelConstants, Outcome, Participant, SignedState, State,
    },
    ledger::{LedgerRequest, RequestKind},
    messages::{Message, Payload, Rejection},
    objective::{FundingStrategy, ObjectiveRequest},
    validator::ConsensusData,
};
use std::sync::Arc;

const ASSET_ALLOCATION: u32 = 0;
const ASSET_GUARANTEE: u32 = 1;

const REQUEST_FUND: u32 = 0;
const REQUEST_DEFUND: u32 = 1;

const OBJECTIVE_OPEN: u32 = 0;
const OBJECTIVE_CLOSE: u32 = 1;

const FUNDING_DIRECT: u32 = 0;
const FUNDING_LEDGER: u32 = 1;
const FUNDING_FAKE: u32 = 2;

fn fixed<const N: usize>(field: &'static str, bytes: &[u8]) -> Result<[u8; N], ConversionError> {
    bytes.try_into().map_err(|_| ConversionError::ByteLength {
        field,
        expected: N,
        got: bytes.len(),
    })
}

fn address(field: &'static str, bytes: &[u8]) -> Result<Address, ConversionError> {
    Ok(Address(fixed(field, bytes)?))
}

fn bytes32(field: &'static str, bytes: &[u8]) -> Result<Bytes32, ConversionError> {
    Ok(Bytes32(fixed(field, bytes)?))
}

fn u256(field: &'static str, bytes: &[u8]) -> Result<U256, ConversionError> {
    U256::from_be_slice(bytes).ok_or(ConversionError::ByteLength {
        field,
        expected: 32,
        got: bytes.len(),
    })
}

fn amount_bytes(amount: &U256) -> Vec<u8> {
    amount.to_bytes32().to_vec()
}

impl From<&Outcome> for OutcomeMsg {
    fn from(outcome: &Outcome) -> Self {
        let assets = outcome
            .0
            .iter()
            .map(|asset| match asset {
                AssetOutcome::Allocation {
                    asset_holder,
                    items,
                } => AssetOutcomeMsg {
                    asset_holder: asset_holder.0.to_vec(),
                    kind: ASSET_ALLOCATION,
                    items: items
                        .iter()
                        .map(|i| AllocationItemMsg {
                            destination: i.destination.0.to_vec(),
                            amount: amount_bytes(&i.amount),
                        })
                        .collect(),
                    ..Default::default()
                },
                AssetOutcome::Guarantee {
                    asset_holder,
                    target_channel_id,
                    destinations,
                } => AssetOutcomeMsg {
                    asset_holder: asset_holder.0.to_vec(),
                    kind: ASSET_GUARANTEE,
                    target_channel_id: target_channel_id.0.to_vec(),
                    destinations: destinations.iter().map(|d| d.0.to_vec()).collect(),
                    ..Default::default()
                },
            })
            .collect();
        Self { assets }
    }
}

impl TryFrom<OutcomeMsg> for Outcome {
    type Error = ConversionError;

    fn try_from(value: OutcomeMsg) -> Result<Self, Self::Error> {
        let assets = value
            .assets
            .into_iter()
            .map(|asset| {
                let asset_holder = address("asset holder", &asset.asset_holder)?;
                match asset.kind {
                    ASSET_ALLOCATION => Ok(AssetOutcome::Allocation {
                        asset_holder,
                        items: asset
                            .items
                            .iter()
                            .map(|i| {
                                Ok(AllocationItem::new(
                                    bytes32("destination", &i.destination)?,
                                    u256("amount", &i.amount)?,
                                ))
                            })
                            .collect::<Result<_, ConversionError>>()?,
                    }),
                    ASSET_GUARANTEE => Ok(AssetOutcome::Guarantee {
                        asset_holder,
                        target_channel_id: bytes32("target channel id", &asset.target_channel_id)?,
                        destinations: asset
                            .destinations
                            .iter()
                            .map(|d| bytes32("destination", d))
                            .collect::<Result<_, _>>()?,
                    }),
                    value => Err(ConversionError::UnknownKind {
                        field: "asset outcome kind",
                        value,
                    }),
                }
            })
            .collect::<Result<_, ConversionError>>()?;
        Ok(Outcome(assets))
    }
}

impl From<&ConsensusData> for ConsensusDataMsg {
    fn from(data: &ConsensusData) -> Self {
        Self {
            further_votes_required: data.further_votes_required,
            // Left out when empty so that a settled state has empty app data.
            proposed_outcome: (!data.proposed_outcome.is_empty())
                .then(|| (&data.proposed_outcome).into()),
        }
    }
}

impl TryFrom<ConsensusDataMsg> for ConsensusData {
    type Error = ConversionError;

    fn try_from(value: ConsensusDataMsg) -> Result<Self, Self::Error> {
        Ok(Self {
            further_votes_required: value.further_votes_required,
            proposed_outcome: match value.proposed_outcome {
                Some(o) => o.try_into()?,
                None => Outcome::default(),
            },
        })
    }
}

impl From<&ChannelConstants> for ConstantsMsg {
    fn from(c: &ChannelConstants) -> Self {
        Self {
            chain_id: amount_bytes(&c.chain_id()),
            participants: c
                .participants()
                .iter()
                .map(|p| ParticipantMsg {
                    signing_address: p.signing_address.0.to_vec(),
                    destination: p.destination.0.to_vec(),
                    participant_id: p.participant_id.clone(),
                })
                .collect(),
            channel_nonce: c.channel_nonce(),
            app_definition: c.app_definition().0.to_vec(),
            challenge_duration: c.challenge_duration(),
        }
    }
}

impl TryFrom<ConstantsMsg> for ChannelConstants {
    type Error = ConversionError;

    fn try_from(value: ConstantsMsg) -> Result<Self, Self::Error> {
        let participants = value
            .participants
            .into_iter()
            .map(|p| {
                Ok(Participant {
                    signing_address: address("signing address", &p.signing_address)?,
                    destination: bytes32("destination", &p.destination)?,
                    participant_id: p.participant_id,
                })
            })
            .collect::<Result<_, ConversionError>>()?;
        Ok(ChannelConstants::new(
            u256("chain id", &value.chain_id)?,
            participants,
            value.channel_nonce,
            address("app definition", &value.app_definition)?,
            value.challenge_duration,
        )?)
    }
}

impl From<&State> for StateMsg {
    fn from(s: &State) -> Self {
        Self {
            constants: Some(s.constants.as_ref().into()),
            turn_num: s.turn_num,
            is_final: s.is_final,
            app_data: s.app_data.clone(),
            outcome: Some((&s.outcome).into()),
        }
    }
}

impl TryFrom<StateMsg> for State {
    type Error = ConversionError;

    fn try_from(value: StateMsg) -> Result<Self, Self::Error> {
        let constants: ChannelConstants = value
            .constants
            .ok_or(ConversionError::MissingField("state constants"))?
            .try_into()?;
        Ok(State {
            constants: Arc::new(constants),
            turn_num: value.turn_num,
            is_final: value.is_final,
            app_data: value.app_data,
            outcome: value
                .outcome
                .ok_or(ConversionError::MissingField("state outcome"))?
                .try_into()?,
        })
    }
}

impl From<&SignedState> for SignedStateMsg {
    fn from(s: &SignedState) -> Self {
        Self {
            state: Some((&s.state).into()),
            signatures: s.signatures.iter().map(|sig| sig.0.to_vec()).collect(),
        }
    }
}

impl TryFrom<SignedStateMsg> for SignedState {
    type Error = ConversionError;

    fn try_from(value: SignedStateMsg) -> Result<Self, Self::Error> {
        let state = value
            .state
            .ok_or(ConversionError::MissingField("signed state"))?
            .try_into()?;
        let signatures = value
            .signatures
            .iter()
            .map(|sig| Ok(Signature(fixed("signature", sig)?)))
            .collect::<Result<_, ConversionError>>()?;
        Ok(SignedState::new(state, signatures))
    }
}

impl From<&LedgerRequest> for LedgerRequestMsg {
    fn from(r: &LedgerRequest) -> Self {
        Self {
            ledger_channel_id: r.ledger_channel_id.0.to_vec(),
            kind: match r.kind {
                RequestKind::Fund => REQUEST_FUND,
                RequestKind::Defund => REQUEST_DEFUND,
            },
            channel_to_be_funded: r.channel_to_be_funded.0.to_vec(),
            asset_holder: r.asset_holder.0.to_vec(),
            amounts: r.amounts.iter().map(amount_bytes).collect(),
        }
    }
}

/// Only the request itself travels, its scheduling state is local.
impl TryFrom<LedgerRequestMsg> for LedgerRequest {
    type Error = ConversionError;

    fn try_from(value: LedgerRequestMsg) -> Result<Self, Self::Error> {
        let kind = match value.kind {
            REQUEST_FUND => RequestKind::Fund,
            REQUEST_DEFUND => RequestKind::Defund,
            value => {
                return Err(ConversionError::UnknownKind {
                    field: "ledger request kind",
                    value,
                })
            }
        };
        Ok(LedgerRequest::new(
            bytes32("ledger channel id", &value.ledger_channel_id)?,
            kind,
            bytes32("channel to be funded", &value.channel_to_be_funded)?,
            address("asset holder", &value.asset_holder)?,
            value
                .amounts
                .iter()
                .map(|a| u256("amount", a))
                .collect::<Result<_, _>>()?,
        ))
    }
}

impl From<&ObjectiveRequest> for ObjectiveMsg {
    fn from(o: &ObjectiveRequest) -> Self {
        match o {
            ObjectiveRequest::OpenChannel { constants, funding } => {
                let (funding_kind, ledger_channel_id) = match funding {
                    FundingStrategy::Direct => (FUNDING_DIRECT, Vec::new()),
                    FundingStrategy::Ledger { ledger_channel_id } => {
                        (FUNDING_LEDGER, ledger_channel_id.0.to_vec())
                    }
                    FundingStrategy::Fake => (FUNDING_FAKE, Vec::new()),
                };
                Self {
                    kind: OBJECTIVE_OPEN,
                    constants: Some(constants.into()),
                    funding_kind,
                    ledger_channel_id,
                    channel_id: Vec::new(),
                }
            }
            ObjectiveRequest::CloseChannel { channel_id } => Self {
                kind: OBJECTIVE_CLOSE,
                channel_id: channel_id.0.to_vec(),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<ObjectiveMsg> for ObjectiveRequest {
    type Error = ConversionError;

    fn try_from(value: ObjectiveMsg) -> Result<Self, Self::Error> {
        match value.kind {
            OBJECTIVE_OPEN => {
                let funding = match value.funding_kind {
                    FUNDING_DIRECT => FundingStrategy::Direct,
                    FUNDING_LEDGER => FundingStrategy::Ledger {
                        ledger_channel_id: bytes32("ledger channel id", &value.ledger_channel_id)?,
                    },
                    FUNDING_FAKE => FundingStrategy::Fake,
                    value => {
                        return Err(ConversionError::UnknownKind {
                            field: "funding kind",
                            value,
                        })
                    }
                };
                Ok(ObjectiveRequest::OpenChannel {
                    constants: value
                        .constants
                        .ok_or(ConversionError::MissingField("objective constants"))?
                        .try_into()?,
                    funding,
                })
            }
            OBJECTIVE_CLOSE => Ok(ObjectiveRequest::CloseChannel {
                channel_id: bytes32("channel id", &value.channel_id)?,
            }),
            value => Err(ConversionError::UnknownKind {
                field: "objective kind",
                value,
            }),
        }
    }
}

impl From<&Rejection> for RejectionMsg {
    fn from(r: &Rejection) -> Self {
        Self {
            channel_id: r.channel_id.0.to_vec(),
            turn_num: r.turn_num,
            reason: r.reason.clone(),
        }
    }
}

impl TryFrom<RejectionMsg> for Rejection {
    type Error = ConversionError;

    fn try_from(value: RejectionMsg) -> Result<Self, Self::Error> {
        Ok(Rejection {
            channel_id: bytes32("channel id", &value.channel_id)?,
            turn_num: value.turn_num,
            reason: value.reason,
        })
    }
}

impl From<&Payload> for PayloadMsg {
    fn from(p: &Payload) -> Self {
        Self {
            wallet_version: p.wallet_version.clone(),
            signed_states: p.signed_states.iter().map(Into::into).collect(),
            ledger_requests: p.ledger_requests.iter().map(Into::into).collect(),
            objectives: p.objectives.iter().map(Into::into).collect(),
            rejections: p.rejections.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<PayloadMsg> for Payload {
    type Error = ConversionError;

    fn try_from(value: PayloadMsg) -> Result<Self, Self::Error> {
        fn all<M, T: TryFrom<M, Error = ConversionError>>(
            items: Vec<M>,
        ) -> Result<Vec<T>, ConversionError> {
            items.into_iter().map(T::try_from).collect()
        }

        Ok(Payload {
            wallet_version: value.wallet_version,
            signed_states: all(value.signed_states)?,
            ledger_requests: all(value.ledger_requests)?,
            objectives: all(value.objectives)?,
            rejections: all(value.rejections)?,
        })
    }
}

impl From<&Message> for EnvelopeMsg {
    fn from(m: &Message) -> Self {
        Self {
            sender: m.sender.clone(),
            recipient: m.recipient.clone(),
            payload: Some((&m.payload).into()),
        }
    }
}

impl TryFrom<EnvelopeMsg> for Message {
    type Error = ConversionError;

    fn try_from(value: EnvelopeMsg) -> Result<Self, Self::Error> {
        Ok(Message {
            sender: value.sender,
            recipient: value.recipient,
            payload: value
                .payload
                .ok_or(ConversionError::MissingField("payload"))?
                .try_into()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_util::*;

    #[test]
    fn guarantees_keep_their_shape() {
        let outcome = Outcome(vec![
            AssetOutcome::Guarantee {
                asset_holder: Address([3; 20]),
                target_channel_id: Bytes32([4; 32]),
                destinations: vec![Bytes32([5; 32]), Bytes32([6; 32])],
            },
            AssetOutcome::Allocation {
                asset_holder: Address([7; 20]),
                items: vec![AllocationItem::new(Bytes32([8; 32]), U256::MAX)],
            },
        ]);
        let msg = OutcomeMsg::from(&outcome);
        assert_eq!(Outcome::try_from(msg).unwrap(), outcome);
    }

    #[test]
    fn constants_are_rederived() {
        let s = signers(3);
        let c = constants(&s, Address([1; 20]));
        let mut msg = ConstantsMsg::from(&c);
        assert_eq!(ChannelConstants::try_from(msg.clone()).unwrap(), c);

        // The id is never sent, changing a field yields another channel.
        msg.channel_nonce += 1;
        assert_ne!(ChannelConstants::try_from(msg.clone()).unwrap().id(), c.id());

        msg.participants.truncate(1);
        assert!(matches!(
            ChannelConstants::try_from(msg),
            Err(ConversionError::Channel(_))
        ));
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let msg = ObjectiveMsg {
            kind: 7,
            ..Default::default()
        };
        assert!(matches!(
            ObjectiveRequest::try_from(msg),
            Err(ConversionError::UnknownKind { value: 7, .. })
        ));
        let msg = LedgerRequestMsg {
            kind: 2,
            ..Default::default()
        };
        assert!(matches!(
            LedgerRequest::try_from(msg),
            Err(ConversionError::UnknownKind { value: 2, .. })
        ));
    }

    #[test]
    fn oversized_amounts_are_rejected() {
        let msg = OutcomeMsg {
            assets: vec![AssetOutcomeMsg {
                asset_holder: vec![0; 20],
                items: vec![AllocationItemMsg {
                    destination: vec![0; 32],
                    amount: vec![1; 33],
                }],
                ..Default::default()
            }],
        };
        assert!(matches!(
            Outcome::try_from(msg),
            Err(ConversionError::ByteLength { field: "amount", .. })
        ));
    }
}
