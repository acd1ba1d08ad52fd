//! Messages exchanged between the engines of a channel's participants.

use crate::{
    channel::{ChannelId, SignedState},
    ledger::LedgerRequest,
    objective::ObjectiveRequest,
};

/// Negative acknowledgment for an item the recipient could not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub channel_id: ChannelId,
    pub turn_num: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub wallet_version: String,
    pub signed_states: Vec<SignedState>,
    pub ledger_requests: Vec<LedgerRequest>,
    pub objectives: Vec<ObjectiveRequest>,
    pub rejections: Vec<Rejection>,
}

impl Payload {
    pub fn new(wallet_version: impl Into<String>) -> Self {
        Self {
            wallet_version: wallet_version.into(),
            signed_states: Vec::new(),
            ledger_requests: Vec::new(),
            objectives: Vec::new(),
            rejections: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signed_states.is_empty()
            && self.ledger_requests.is_empty()
            && self.objectives.is_empty()
            && self.rejections.is_empty()
    }

    /// Whether a payload written by `ours` can be read. Versions are
    /// compatible when they agree up to the first dot.
    pub fn is_compatible_with(&self, ours: &str) -> bool {
        fn major(v: &str) -> &str {
            v.split('.').next().unwrap_or(v)
        }
        major(&self.wallet_version) == major(ours)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Participant id of the sending engine.
    pub sender: String,
    pub recipient: String,
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_agree_on_major() {
        let p = Payload::new("channel-engine/0.1");
        assert!(p.is_compatible_with("channel-engine/0.7"));
        assert!(!p.is_compatible_with("channel-engine/1.0"));
        assert!(!p.is_compatible_with("other/0.1"));
        assert!(p.is_empty());
    }
}
