//! Channel identity and the data model of signed channel states.

mod outcome;
mod state;

use crate::{
    abiencode::{
        self,
        types::{Address, Bytes32, Hash, U256},
    },
    sig::SigError,
};
use serde::Serialize;
use thiserror::Error;

pub use outcome::*;
pub use state::*;

/// Index of a participant in [ChannelConstants::participants].
pub type PartIdx = usize;

/// Content-addressed identifier of a channel, see [ChannelConstants::new].
pub type ChannelId = Bytes32;

/// Receiver of funds in an outcome. Either a participant's address
/// (right-aligned) or the id of another channel.
pub type Destination = Bytes32;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("encoding: {0}")]
    Encoding(#[from] abiencode::Error),
    #[error("signature: {0}")]
    Signature(#[from] SigError),
    #[error("signature recovers to {0}, which is not a participant")]
    NotAParticipant(Address),
    #[error("participant {0} signed more than once")]
    DuplicateSigner(PartIdx),
    #[error("channel needs at least two participants, got {0}")]
    TooFewParticipants(usize),
    #[error("participant {0} is listed twice")]
    DuplicateParticipant(Address),
    #[error("signer {0} is not a participant of the channel")]
    NotOurChannel(Address),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Participant {
    pub signing_address: Address,
    pub destination: Destination,
    /// Name used by the message transport to reach this participant. Not
    /// part of the channel id.
    pub participant_id: String,
}

impl Participant {
    /// Participant receiving funds at its own signing address.
    pub fn new(signing_address: Address, participant_id: impl Into<String>) -> Self {
        Self {
            signing_address,
            destination: signing_address.to_destination(),
            participant_id: participant_id.into(),
        }
    }
}

/// Immutable identity of a channel. Constructed through [ChannelConstants::new]
/// so the id always matches the fields it is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConstants {
    chain_id: U256,
    participants: Vec<Participant>,
    channel_nonce: u64,
    app_definition: Address,
    challenge_duration: u64,
    id: ChannelId,
}

#[derive(Serialize)]
struct IdPreimage {
    chain_id: U256,
    participants: Vec<Address>,
    channel_nonce: U256,
}

impl ChannelConstants {
    pub fn new(
        chain_id: U256,
        participants: Vec<Participant>,
        channel_nonce: u64,
        app_definition: Address,
        challenge_duration: u64,
    ) -> Result<Self, ChannelError> {
        if participants.len() < 2 {
            return Err(ChannelError::TooFewParticipants(participants.len()));
        }
        for (i, p) in participants.iter().enumerate() {
            if participants[..i]
                .iter()
                .any(|q| q.signing_address == p.signing_address)
            {
                return Err(ChannelError::DuplicateParticipant(p.signing_address));
            }
        }

        let id = channel_id(chain_id, &participants, channel_nonce)?;
        Ok(Self {
            chain_id,
            participants,
            channel_nonce,
            app_definition,
            challenge_duration,
            id,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn chain_id(&self) -> U256 {
        self.chain_id
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    pub fn channel_nonce(&self) -> u64 {
        self.channel_nonce
    }

    pub fn app_definition(&self) -> Address {
        self.app_definition
    }

    pub fn challenge_duration(&self) -> u64 {
        self.challenge_duration
    }

    pub fn signing_addresses(&self) -> Vec<Address> {
        self.participants.iter().map(|p| p.signing_address).collect()
    }

    pub fn index_of(&self, addr: Address) -> Option<PartIdx> {
        self.participants
            .iter()
            .position(|p| p.signing_address == addr)
    }

    /// Turn number of the post-fund state.
    pub fn post_fund_turn(&self) -> u64 {
        self.participants.len() as u64
    }

    /// Participant expected to sign turn `turn_num` first.
    pub fn mover(&self, turn_num: u64) -> PartIdx {
        (turn_num % self.participants.len() as u64) as PartIdx
    }
}

/// `keccak256(abi.encode(chainId, participants, channelNonce))`.
pub fn channel_id(
    chain_id: U256,
    participants: &[Participant],
    channel_nonce: u64,
) -> Result<ChannelId, abiencode::Error> {
    let preimage = IdPreimage {
        chain_id,
        participants: participants.iter().map(|p| p.signing_address).collect(),
        channel_nonce: channel_nonce.into(),
    };
    abiencode::to_fnargs_hash(&preimage).map(Into::into)
}

/// Hash signed by a challenger to authorize a challenge on the adjudicator:
/// `keccak256(abi.encode(channelId, turnNumRecord, "forceMove"))`.
pub fn challenge_message(channel_id: ChannelId, turn_num_record: u64) -> Result<Hash, abiencode::Error> {
    #[derive(Serialize)]
    struct ForceMove<'a> {
        channel_id: ChannelId,
        turn_num_record: u64,
        tag: &'a str,
    }
    abiencode::to_fnargs_hash(&ForceMove {
        channel_id,
        turn_num_record,
        tag: "forceMove",
    })
}


#[cfg(test)]
mod tests {
    use super::{test_util::*, *};

    #[test]
    fn channel_id_depends_on_nonce_and_order() {
        let s = signers(2);
        let a = constants(&s, Address::default());
        let mut ps = a.participants().to_vec();
        let b = ChannelConstants::new(1.into(), ps.clone(), 8, Address::default(), 100).unwrap();
        ps.reverse();
        let c = ChannelConstants::new(1.into(), ps, 7, Address::default(), 100).unwrap();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id(), constants(&s, Address::default()).id());
    }

    #[test]
    fn participant_id_is_not_hashed() {
        let s = signers(2);
        let a = constants(&s, Address::default());
        let mut ps = a.participants().to_vec();
        ps[0].participant_id = "someone-else".into();
        let b = ChannelConstants::new(1.into(), ps, 7, Address::default(), 100).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_malformed_participant_lists() {
        let s = signers(2);
        let p = Participant::new(s[0].address(), "a");
        assert!(matches!(
            ChannelConstants::new(1.into(), vec![p.clone()], 0, Address::default(), 1),
            Err(ChannelError::TooFewParticipants(1))
        ));
        assert!(matches!(
            ChannelConstants::new(1.into(), vec![p.clone(), p], 0, Address::default(), 1),
            Err(ChannelError::DuplicateParticipant(_))
        ));
    }

    #[test]
    fn mover_rotates() {
        let c = constants(&signers(3), Address::default());
        assert_eq!(c.post_fund_turn(), 3);
        assert_eq!(c.mover(0), 0);
        assert_eq!(c.mover(4), 1);
        assert_eq!(c.mover(5), 2);
    }
}
