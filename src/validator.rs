//! Decides whether one state may follow another.
//!
//! The common rules (identity, turn numbers, finality, setup phase) are
//! checked here. Everything else is delegated to the rules of the channel's
//! `appDefinition`: the built-in null and consensus apps, or an externally
//! registered [ExternalApp].

pub mod consensus;

use crate::{
    abiencode::types::Address,
    channel::{Outcome, State},
    wire::ConversionError,
};
use core::fmt::Debug;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

pub use consensus::{ConsensusData, ConsensusMove};

/// App definition of channels without application logic.
pub const NULL_APP: Address = Address([0; 20]);

/// App definition of ledger channels.
pub const CONSENSUS_APP: Address = Address([
    0xc0, 0x45, 0x5e, 0x45, 0x05, 0xa9, 0x90, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x01,
]);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("states belong to different channels")]
    ChannelChanged,
    #[error("turn {0} is final, no further transitions are allowed")]
    FromFinal(u64),
    #[error("turn {to} does not follow turn {from}")]
    TurnNotIncremented { from: u64, to: u64 },
    #[error("the pre-fund state can only be followed by the post-fund state, got turn {0}")]
    SetupSkipped(u64),
    #[error("the post-fund state must keep outcome, app data and finality of the pre-fund state")]
    SetupChanged,
    #[error("total funds per asset holder are not conserved")]
    FundsNotConserved,
    #[error("the set of asset holders changed")]
    AssetsChanged,
    #[error("no rules registered for app {0}")]
    UnknownApp(Address),
    #[error("app {0} rejected the transition")]
    AppRejected(Address),
    #[error("invalid app data: {0}")]
    InvalidAppData(String),
    #[error("invalid consensus transition: {0}")]
    Consensus(&'static str),
}

impl From<ConversionError> for TransitionError {
    fn from(e: ConversionError) -> Self {
        TransitionError::InvalidAppData(e.to_string())
    }
}

/// Application rules provided from outside the engine. The engine trusts the
/// answer and does not interpret app data itself.
pub trait ExternalApp: Debug + Send + Sync {
    fn is_valid_app_transition(
        &self,
        app_data: &[u8],
        outcome: &Outcome,
        next_app_data: &[u8],
        next_outcome: &Outcome,
    ) -> bool;
}

#[derive(Debug, Clone)]
pub enum AppRules {
    /// Any reallocation within the same asset holders that conserves funds.
    Null,
    /// Propose/vote/veto/pass, see [consensus].
    Consensus,
    External(Arc<dyn ExternalApp>),
}

impl AppRules {
    /// Whether a new state must carry the signature of the participant whose
    /// turn it is.
    pub fn requires_turn_taking(&self) -> bool {
        matches!(self, AppRules::Consensus)
    }

    fn check(&self, app_definition: Address, from: &State, to: &State) -> Result<(), TransitionError> {
        match self {
            AppRules::Null => {
                if !from.outcome.asset_holders().eq(to.outcome.asset_holders()) {
                    return Err(TransitionError::AssetsChanged);
                }
                if !from.outcome.conserves(&to.outcome) {
                    return Err(TransitionError::FundsNotConserved);
                }
                Ok(())
            }
            AppRules::Consensus => consensus::validate(from, to).map(|_| ()),
            AppRules::External(app) => {
                if app.is_valid_app_transition(&from.app_data, &from.outcome, &to.app_data, &to.outcome)
                {
                    Ok(())
                } else {
                    Err(TransitionError::AppRejected(app_definition))
                }
            }
        }
    }
}

/// Rules keyed by `appDefinition`.
#[derive(Debug, Clone)]
pub struct AppRegistry {
    apps: HashMap<Address, AppRules>,
}

impl Default for AppRegistry {
    fn default() -> Self {
        let mut apps = HashMap::new();
        apps.insert(NULL_APP, AppRules::Null);
        apps.insert(CONSENSUS_APP, AppRules::Consensus);
        Self { apps }
    }
}

impl AppRegistry {
    pub fn register(&mut self, app_definition: Address, rules: AppRules) {
        self.apps.insert(app_definition, rules);
    }

    pub fn register_external(&mut self, app_definition: Address, app: Arc<dyn ExternalApp>) {
        self.register(app_definition, AppRules::External(app));
    }

    pub fn rules(&self, app_definition: Address) -> Result<&AppRules, TransitionError> {
        self.apps
            .get(&app_definition)
            .ok_or(TransitionError::UnknownApp(app_definition))
    }

    /// `Ok` if `to` may follow `from`.
    pub fn validate_transition(&self, from: &State, to: &State) -> Result<(), TransitionError> {
        if from.constants != to.constants {
            return Err(TransitionError::ChannelChanged);
        }
        if from.is_final {
            return Err(TransitionError::FromFinal(from.turn_num));
        }

        if from.is_prefund() {
            if !to.is_postfund() {
                return Err(TransitionError::SetupSkipped(to.turn_num));
            }
            if from.outcome != to.outcome || from.app_data != to.app_data || from.is_final != to.is_final {
                return Err(TransitionError::SetupChanged);
            }
            return Ok(());
        }

        if to.turn_num != from.turn_num + 1 {
            return Err(TransitionError::TurnNotIncremented {
                from: from.turn_num,
                to: to.turn_num,
            });
        }

        let app_definition = to.constants.app_definition();
        self.rules(app_definition)?.check(app_definition, from, to)
    }

    pub fn is_valid_transition(&self, from: &State, to: &State) -> bool {
        self.validate_transition(from, to).is_ok()
    }
}
