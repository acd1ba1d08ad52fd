//! Two engines, Alice and Bob, sharing one in-memory chain and a framed
//! byte transport.

use channel_engine::{
    chain::MemoryChain,
    channel::{AllocationItem, ChannelId, Outcome, Participant},
    objective::{FundingStrategy, ObjectiveId, ObjectiveStatus},
    sig::Signer,
    store::MemoryPersistence,
    wire::{BytesBus, ProtoBufEncodingLayer},
    Address, CreateChannelParams, Engine, EngineConfig,
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use std::{collections::VecDeque, sync::Arc};
use tracing_subscriber::EnvFilter;

pub const HOLDER: Address = Address([9; 20]);

/// Frames in flight, in sending order.
#[derive(Debug, Default)]
pub struct Network {
    frames: Mutex<VecDeque<(String, Vec<u8>)>>,
}

#[derive(Debug, Clone)]
pub struct Wire(Arc<Network>);

impl BytesBus for Wire {
    fn send_to_participant(&self, recipient: &str, msg: &[u8]) {
        self.0.frames.lock().push_back((recipient.to_string(), msg.to_vec()));
    }
}

pub type TestEngine = Engine<ProtoBufEncodingLayer<Wire>>;

pub struct Setup {
    pub chain: Arc<MemoryChain>,
    pub net: Arc<Network>,
    pub signers: Vec<Signer>,
    pub alice: Arc<TestEngine>,
    pub bob: Arc<TestEngine>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn setup() -> Setup {
    init_tracing();
    let mut rng = StdRng::seed_from_u64(7);
    let signers: Vec<Signer> = (0..2).map(|_| Signer::new(&mut rng)).collect();
    let chain = Arc::new(MemoryChain::new());
    let net = Arc::new(Network::default());
    let engine = |signer: &Signer| {
        Arc::new(Engine::new(
            EngineConfig::default(),
            signer.clone(),
            chain.clone(),
            Arc::new(MemoryPersistence::new()),
            ProtoBufEncodingLayer::new(Wire(net.clone())),
        ))
    };
    Setup {
        alice: engine(&signers[0]),
        bob: engine(&signers[1]),
        chain: chain.clone(),
        net: net.clone(),
        signers,
    }
}

impl Setup {
    pub fn participants(&self) -> Vec<Participant> {
        vec![
            Participant::new(self.signers[0].address(), "alice"),
            Participant::new(self.signers[1].address(), "bob"),
        ]
    }

    pub fn outcome(&self, alice: u64, bob: u64) -> Outcome {
        let p = self.participants();
        Outcome::allocation(
            HOLDER,
            vec![
                AllocationItem::new(p[0].destination, alice.into()),
                AllocationItem::new(p[1].destination, bob.into()),
            ],
        )
    }

    pub fn params(&self, app_definition: Address, funding: FundingStrategy, alice: u64, bob: u64) -> CreateChannelParams {
        CreateChannelParams {
            chain_id: 1.into(),
            participants: self.participants(),
            app_definition,
            challenge_duration: 100,
            outcome: self.outcome(alice, bob),
            app_data: vec![],
            funding,
        }
    }

    fn engine(&self, participant_id: &str) -> &TestEngine {
        match participant_id {
            "alice" => self.alice.as_ref(),
            "bob" => self.bob.as_ref(),
            other => panic!("no engine for {}", other),
        }
    }

    /// Number of frames waiting for delivery.
    pub fn in_flight(&self) -> usize {
        self.net.frames.lock().len()
    }

    /// Delivers frames and chain updates until both engines are quiet. With
    /// `duplicate`, every frame is delivered twice.
    pub async fn settle_with(&self, duplicate: bool) {
        for _ in 0..1000 {
            let next = self.net.frames.lock().pop_front();
            match next {
                Some((recipient, frame)) => {
                    let engine = self.engine(&recipient);
                    engine.push_bytes(&frame).await.unwrap();
                    if duplicate {
                        engine.push_bytes(&frame).await.unwrap();
                    }
                }
                None => {
                    self.alice.poll_chain().await;
                    self.bob.poll_chain().await;
                    if self.in_flight() == 0 {
                        return;
                    }
                }
            }
        }
        panic!("engines did not settle");
    }

    pub async fn settle(&self) {
        self.settle_with(false).await
    }

    /// Opens a directly funded channel proposed by Alice.
    pub async fn open_direct(&self, app_definition: Address, alice: u64, bob: u64) -> ChannelId {
        let id = self
            .alice
            .create_channel(self.params(app_definition, FundingStrategy::Direct, alice, bob))
            .await
            .unwrap();
        self.settle().await;
        self.bob
            .approve_objective(&ObjectiveId::open_channel(id))
            .await
            .unwrap();
        self.settle().await;
        for engine in [&self.alice, &self.bob] {
            assert_eq!(status(engine, &ObjectiveId::open_channel(id)), ObjectiveStatus::Succeeded);
        }
        id
    }
}

pub fn status(engine: &TestEngine, id: &ObjectiveId) -> ObjectiveStatus {
    engine.get_objective(id).unwrap().status().clone()
}
