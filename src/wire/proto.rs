//! Protobuf messages exchanged between engines.
//!
//! Written out with the prost derive instead of generated from `.proto`
//! files, the tags below are the wire contract. Addresses, hashes and
//! amounts travel as big-endian bytes.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocationItemMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub destination: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssetOutcomeMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub asset_holder: Vec<u8>,
    /// 0 = allocation, 1 = guarantee.
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(message, repeated, tag = "3")]
    pub items: Vec<AllocationItemMsg>,
    #[prost(bytes = "vec", tag = "4")]
    pub target_channel_id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub destinations: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutcomeMsg {
    #[prost(message, repeated, tag = "1")]
    pub assets: Vec<AssetOutcomeMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub signing_address: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub destination: Vec<u8>,
    #[prost(string, tag = "3")]
    pub participant_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConstantsMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_id: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub participants: Vec<ParticipantMsg>,
    #[prost(uint64, tag = "3")]
    pub channel_nonce: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub app_definition: Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub challenge_duration: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateMsg {
    #[prost(message, optional, tag = "1")]
    pub constants: Option<ConstantsMsg>,
    #[prost(uint64, tag = "2")]
    pub turn_num: u64,
    #[prost(bool, tag = "3")]
    pub is_final: bool,
    #[prost(bytes = "vec", tag = "4")]
    pub app_data: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub outcome: Option<OutcomeMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedStateMsg {
    #[prost(message, optional, tag = "1")]
    pub state: Option<StateMsg>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub signatures: Vec<Vec<u8>>,
}

/// App data of ledger channels.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusDataMsg {
    #[prost(uint32, tag = "1")]
    pub further_votes_required: u32,
    #[prost(message, optional, tag = "2")]
    pub proposed_outcome: Option<OutcomeMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LedgerRequestMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub ledger_channel_id: Vec<u8>,
    /// 0 = fund, 1 = defund.
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub channel_to_be_funded: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub asset_holder: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub amounts: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectiveMsg {
    /// 0 = open channel, 1 = close channel.
    #[prost(uint32, tag = "1")]
    pub kind: u32,
    #[prost(message, optional, tag = "2")]
    pub constants: Option<ConstantsMsg>,
    /// 0 = direct, 1 = ledger, 2 = fake.
    #[prost(uint32, tag = "3")]
    pub funding_kind: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub ledger_channel_id: Vec<u8>,
    /// Channel to close, unset for open objectives.
    #[prost(bytes = "vec", tag = "5")]
    pub channel_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RejectionMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub turn_num: u64,
    #[prost(string, tag = "3")]
    pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PayloadMsg {
    #[prost(string, tag = "1")]
    pub wallet_version: String,
    #[prost(message, repeated, tag = "2")]
    pub signed_states: Vec<SignedStateMsg>,
    #[prost(message, repeated, tag = "3")]
    pub ledger_requests: Vec<LedgerRequestMsg>,
    #[prost(message, repeated, tag = "4")]
    pub objectives: Vec<ObjectiveMsg>,
    #[prost(message, repeated, tag = "5")]
    pub rejections: Vec<RejectionMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvelopeMsg {
    #[prost(string, tag = "1")]
    pub sender: String,
    #[prost(string, tag = "2")]
    pub recipient: String,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<PayloadMsg>,
}
