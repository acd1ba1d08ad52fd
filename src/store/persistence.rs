//! Storage boundary of the engine.
//!
//! The engine only needs per-channel append operations and an atomic nonce
//! counter per set of signing addresses. Well-formedness of what is stored
//! (non-zero addresses, unique nonces) is enforced here, not in the engine.

use crate::{
    abiencode::types::Address,
    channel::{ChannelConstants, ChannelId, SignedState},
};
use core::fmt::Debug;
use parking_lot::Mutex;
use std::collections::{hash_map::Entry, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("the zero address is not a valid signing address")]
    ZeroAddress,
    #[error("nonce {0} was already used for this set of signing addresses")]
    DuplicateNonce(u64),
    #[error("nonces for this set of signing addresses are exhausted")]
    NoncesExhausted,
    #[error("channel {0} is not stored")]
    UnknownChannel(ChannelId),
    #[error("channel {0} is stored with different constants")]
    ConstantsConflict(ChannelId),
}

pub trait Persistence: Debug + Send + Sync {
    /// Stores the constants of a new channel and marks its nonce as used.
    /// Storing the same constants again is a no-op.
    fn store_constants(&self, constants: &ChannelConstants) -> Result<(), PersistenceError>;

    fn append_signed_state(&self, signed: &SignedState) -> Result<(), PersistenceError>;

    /// Every state appended for the channel, oldest first.
    fn signed_states(&self, channel_id: ChannelId) -> Result<Vec<SignedState>, PersistenceError>;

    /// Atomically allocates the next unused nonce for `addresses`. Concurrent
    /// callers never receive the same value.
    fn reserve_nonce(&self, addresses: &[Address]) -> Result<u64, PersistenceError>;

    /// Marks a nonce chosen elsewhere as used, failing if it already was.
    fn record_nonce(&self, addresses: &[Address], nonce: u64) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
struct NonceRecord {
    next: u64,
    used: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct ChannelRows {
    constants: Option<ChannelConstants>,
    states: Vec<SignedState>,
}

/// Keeps everything in memory, for tests and short-lived engines.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    channels: Mutex<HashMap<ChannelId, ChannelRows>>,
    nonces: Mutex<HashMap<Vec<Address>, NonceRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

fn nonce_key(addresses: &[Address]) -> Result<Vec<Address>, PersistenceError> {
    if addresses.iter().any(Address::is_zero) {
        return Err(PersistenceError::ZeroAddress);
    }
    let mut key = addresses.to_vec();
    key.sort();
    Ok(key)
}

impl Persistence for MemoryPersistence {
    fn store_constants(&self, constants: &ChannelConstants) -> Result<(), PersistenceError> {
        let key = nonce_key(&constants.signing_addresses())?;
        let mut channels = self.channels.lock();
        let rows = channels.entry(constants.id()).or_default();
        match &rows.constants {
            Some(stored) if stored == constants => return Ok(()),
            Some(_) => return Err(PersistenceError::ConstantsConflict(constants.id())),
            None => rows.constants = Some(constants.clone()),
        }
        self.nonces
            .lock()
            .entry(key)
            .or_default()
            .used
            .insert(constants.channel_nonce());
        Ok(())
    }

    fn append_signed_state(&self, signed: &SignedState) -> Result<(), PersistenceError> {
        let id = signed.state.channel_id();
        let mut channels = self.channels.lock();
        match channels.get_mut(&id) {
            Some(rows) if rows.constants.is_some() => {
                rows.states.push(signed.clone());
                Ok(())
            }
            _ => Err(PersistenceError::UnknownChannel(id)),
        }
    }

    fn signed_states(&self, channel_id: ChannelId) -> Result<Vec<SignedState>, PersistenceError> {
        self.channels
            .lock()
            .get(&channel_id)
            .map(|rows| rows.states.clone())
            .ok_or(PersistenceError::UnknownChannel(channel_id))
    }

    fn reserve_nonce(&self, addresses: &[Address]) -> Result<u64, PersistenceError> {
        let key = nonce_key(addresses)?;
        let mut nonces = self.nonces.lock();
        let record = nonces.entry(key).or_default();
        while record.used.contains(&record.next) {
            record.next = record
                .next
                .checked_add(1)
                .ok_or(PersistenceError::NoncesExhausted)?;
        }
        let nonce = record.next;
        record.used.insert(nonce);
        record.next = nonce.saturating_add(1);
        Ok(nonce)
    }

    fn record_nonce(&self, addresses: &[Address], nonce: u64) -> Result<(), PersistenceError> {
        let key = nonce_key(addresses)?;
        match self.nonces.lock().entry(key) {
            Entry::Occupied(mut e) => {
                if !e.get_mut().used.insert(nonce) {
                    return Err(PersistenceError::DuplicateNonce(nonce));
                }
            }
            Entry::Vacant(e) => {
                e.insert(NonceRecord::default()).used.insert(nonce);
            }
        }
        Ok(())
    }
}
