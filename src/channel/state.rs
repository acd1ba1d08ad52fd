use super::{ChannelConstants, ChannelError, ChannelId, Outcome, PartIdx};
use crate::{
    abiencode::{
        self, as_bytes,
        types::{Address, Hash, Signature},
    },
    sig::{self, Signer},
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

/// One version of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub constants: Arc<ChannelConstants>,
    pub turn_num: u64,
    pub is_final: bool,
    pub app_data: Vec<u8>,
    pub outcome: Outcome,
}

#[derive(Serialize)]
struct StateEncoding<'a> {
    channel_id: ChannelId,
    turn_num: u64,
    is_final: bool,
    app_definition: Address,
    challenge_duration: u64,
    #[serde(with = "as_bytes")]
    app_data: &'a [u8],
    outcome: &'a Outcome,
}

impl State {
    /// Pre-fund state (turn 0) of a new channel.
    pub fn prefund(constants: Arc<ChannelConstants>, outcome: Outcome, app_data: Vec<u8>) -> Self {
        Self {
            constants,
            turn_num: 0,
            is_final: false,
            app_data,
            outcome,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.constants.id()
    }

    pub fn is_prefund(&self) -> bool {
        self.turn_num == 0
    }

    pub fn is_postfund(&self) -> bool {
        self.turn_num == self.constants.post_fund_turn()
    }

    /// Keccak256 of the abi encoding, which is what participants sign.
    pub fn hash(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_hash(&StateEncoding {
            channel_id: self.channel_id(),
            turn_num: self.turn_num,
            is_final: self.is_final,
            app_definition: self.constants.app_definition(),
            challenge_duration: self.constants.challenge_duration(),
            app_data: &self.app_data,
            outcome: &self.outcome,
        })
    }

    /// Create the state that follows this one, with everything but the turn
    /// number unchanged.
    pub fn make_next_state(&self) -> Self {
        Self {
            turn_num: self.turn_num + 1,
            ..self.clone()
        }
    }

    /// Post-fund state following this pre-fund state.
    pub fn make_postfund_state(&self) -> Self {
        Self {
            turn_num: self.constants.post_fund_turn(),
            ..self.clone()
        }
    }

    /// Final state following this one, keeping the outcome.
    pub fn make_final_state(&self) -> Self {
        Self {
            turn_num: self.turn_num + 1,
            is_final: true,
            ..self.clone()
        }
    }

    pub fn sign(&self, signer: &Signer) -> Result<SignedState, ChannelError> {
        if self.constants.index_of(signer.address()).is_none() {
            return Err(ChannelError::NotOurChannel(signer.address()));
        }
        let sig = signer.sign_eth(self.hash()?)?;
        Ok(SignedState {
            state: self.clone(),
            signatures: vec![sig],
        })
    }
}

/// A state together with the signatures collected for it so far.
///
/// Signatures are kept raw since they arrive from untrusted peers, use
/// [SignedState::signers] to attribute them to participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    pub state: State,
    pub signatures: Vec<Signature>,
}

impl SignedState {
    pub fn new(state: State, signatures: Vec<Signature>) -> Self {
        Self { state, signatures }
    }

    /// Recovers every signature and maps it to the participant index of its
    /// signer. Fails on foreign or malformed signatures and on participants
    /// that signed twice.
    pub fn signers(&self) -> Result<BTreeMap<PartIdx, Signature>, ChannelError> {
        let hash = self.state.hash()?;
        let mut signers = BTreeMap::new();
        for sig in &self.signatures {
            let addr = sig::recover_signer(hash, sig)?;
            let idx = self
                .state
                .constants
                .index_of(addr)
                .ok_or(ChannelError::NotAParticipant(addr))?;
            if signers.insert(idx, *sig).is_some() {
                return Err(ChannelError::DuplicateSigner(idx));
            }
        }
        Ok(signers)
    }

    pub fn from_signers(state: State, signers: &BTreeMap<PartIdx, Signature>) -> Self {
        Self {
            state,
            signatures: signers.values().copied().collect(),
        }
    }

    /// Adds our own signature unless it is already present.
    pub fn add_signature(&mut self, signer: &Signer) -> Result<(), ChannelError> {
        let signed = self.state.sign(signer)?;
        for sig in signed.signatures {
            if !self.signatures.contains(&sig) {
                self.signatures.push(sig);
            }
        }
        Ok(())
    }

    /// True if every participant signed. Verifies all signatures.
    pub fn is_supported(&self) -> Result<bool, ChannelError> {
        Ok(self.signers()?.len() == self.state.constants.num_participants())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{test_util::*, AllocationItem};

    fn state(n: usize) -> (Vec<Signer>, State) {
        let s = signers(n);
        let c = Arc::new(constants(&s, Address::default()));
        let outcome = Outcome::allocation(
            Address([9; 20]),
            s.iter()
                .map(|s| AllocationItem::new(s.address().to_destination(), 5.into()))
                .collect(),
        );
        (s, State::prefund(c, outcome, vec![]))
    }

    #[test]
    fn hash_covers_every_field() {
        let (_, s) = state(2);
        let h = s.hash().unwrap();
        assert_ne!(s.make_next_state().hash().unwrap(), h);
        assert_ne!(s.make_final_state().hash().unwrap(), h);

        let mut with_data = s.clone();
        with_data.app_data = vec![1];
        assert_ne!(with_data.hash().unwrap(), h);

        let mut other_outcome = s.clone();
        other_outcome.outcome = Outcome::default();
        assert_ne!(other_outcome.hash().unwrap(), h);
    }

    #[test]
    fn signatures_are_attributed() {
        let (s, st) = state(3);
        let mut signed = st.sign(&s[2]).unwrap();
        signed.add_signature(&s[0]).unwrap();
        signed.add_signature(&s[0]).unwrap();

        let signers = signed.signers().unwrap();
        assert_eq!(signers.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert!(!signed.is_supported().unwrap());

        signed.add_signature(&s[1]).unwrap();
        assert!(signed.is_supported().unwrap());
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let (_, st) = state(2);
        let stranger = signers(3).pop().unwrap();
        assert!(matches!(
            st.sign(&stranger),
            Err(ChannelError::NotOurChannel(_))
        ));

        let sig = stranger.sign_eth(st.hash().unwrap()).unwrap();
        let signed = SignedState::new(st, vec![sig]);
        assert!(matches!(
            signed.signers(),
            Err(ChannelError::NotAParticipant(_))
        ));
    }

    #[test]
    fn duplicate_signature_is_rejected() {
        let (s, st) = state(2);
        let mut signed = st.sign(&s[0]).unwrap();
        signed.signatures.push(signed.signatures[0]);
        assert!(matches!(
            signed.signers(),
            Err(ChannelError::DuplicateSigner(0))
        ));
    }
}
