mod common;

use channel_engine::{
    challenge::{ChallengeOutcome, ChallengeState},
    ledger::{RequestKind, RequestStatus},
    objective::{FundingStrategy, ObjectiveId, ObjectiveStatus},
    validator::{CONSENSUS_APP, NULL_APP},
    EngineError,
};
use common::{setup, status, HOLDER};
use std::time::Duration;

#[tokio::test]
async fn direct_channel_lifecycle() {
    let s = setup();
    let id = s
        .alice
        .create_channel(s.params(NULL_APP, FundingStrategy::Direct, 5, 5))
        .await
        .unwrap();
    s.settle().await;

    // Nothing moves until Bob agrees.
    let open = ObjectiveId::open_channel(id);
    assert_eq!(status(&s.bob, &open), ObjectiveStatus::PendingApproval);
    assert!(s.alice.supported_state(id).is_none());
    assert!(s.chain.status(id).holdings.is_empty());

    s.bob.approve_objective(&open).await.unwrap();
    s.settle().await;
    assert_eq!(status(&s.alice, &open), ObjectiveStatus::Succeeded);
    assert_eq!(status(&s.bob, &open), ObjectiveStatus::Succeeded);
    assert_eq!(s.chain.status(id).holding(HOLDER), 10.into());
    assert!(s.bob.supported_state(id).unwrap().state.is_postfund());
    // Nobody needs the chain feed once the channel runs.
    assert!(!s.alice.is_watching(id) && !s.bob.is_watching(id));
    assert_eq!(s.chain.registrations(id), 0);

    // Alice proposes a payment, it counts once Bob signs the same state.
    let paid = s.outcome(4, 6);
    s.alice.update_channel(id, paid.clone(), vec![]).await.unwrap();
    s.settle().await;
    assert_eq!(s.bob.supported_state(id).unwrap().state.turn_num, 2);
    assert!(matches!(
        s.alice.update_channel(id, s.outcome(3, 7), vec![]).await,
        Err(EngineError::UpdateInFlight(_))
    ));
    s.bob.update_channel(id, paid.clone(), vec![]).await.unwrap();
    s.settle().await;
    for engine in [&s.alice, &s.bob] {
        let supported = engine.supported_state(id).unwrap();
        assert_eq!(supported.state.turn_num, 3);
        assert_eq!(supported.state.outcome, paid);
    }

    let close = s.alice.close_channel(id).await.unwrap();
    s.settle().await;
    assert_eq!(status(&s.bob, &close), ObjectiveStatus::PendingApproval);
    s.bob.approve_objective(&close).await.unwrap();
    s.settle().await;

    assert_eq!(status(&s.alice, &close), ObjectiveStatus::Succeeded);
    assert_eq!(status(&s.bob, &close), ObjectiveStatus::Succeeded);
    let p = s.participants();
    assert_eq!(s.chain.payout(HOLDER, p[0].destination), 4.into());
    assert_eq!(s.chain.payout(HOLDER, p[1].destination), 6.into());
    assert!(s.chain.status(id).finalized);
    assert!(!s.alice.is_watching(id) && !s.bob.is_watching(id));
    assert_eq!(s.chain.registrations(id), 0);
}

#[tokio::test]
async fn duplicated_messages_change_nothing() {
    let s = setup();
    let id = s
        .alice
        .create_channel(s.params(NULL_APP, FundingStrategy::Direct, 2, 3))
        .await
        .unwrap();
    s.settle_with(true).await;
    s.bob
        .approve_objective(&ObjectiveId::open_channel(id))
        .await
        .unwrap();
    s.settle_with(true).await;

    for engine in [&s.alice, &s.bob] {
        assert_eq!(
            status(engine, &ObjectiveId::open_channel(id)),
            ObjectiveStatus::Succeeded
        );
        assert!(engine.supported_state(id).unwrap().state.is_postfund());
    }
    // Deposits are idempotent, nobody paid twice.
    assert_eq!(s.chain.status(id).holding(HOLDER), 5.into());
}

#[tokio::test]
async fn ledger_funds_and_defunds_a_channel() {
    let s = setup();
    let ledger = s.open_direct(CONSENSUS_APP, 10, 10).await;

    let funding = FundingStrategy::Ledger {
        ledger_channel_id: ledger,
    };
    let id = s
        .alice
        .create_channel(s.params(NULL_APP, funding, 3, 2))
        .await
        .unwrap();
    s.settle().await;
    s.bob
        .approve_objective(&ObjectiveId::open_channel(id))
        .await
        .unwrap();
    s.settle().await;

    let p = s.participants();
    for engine in [&s.alice, &s.bob] {
        assert_eq!(
            status(engine, &ObjectiveId::open_channel(id)),
            ObjectiveStatus::Succeeded
        );
        let requests = engine.ledger_requests(ledger);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, RequestKind::Fund);
        assert_eq!(requests[0].status, RequestStatus::Succeeded);

        let outcome = engine.supported_state(ledger).unwrap().state.outcome;
        assert_eq!(outcome.amount_for(HOLDER, id), 5.into());
        assert_eq!(outcome.amount_for(HOLDER, p[0].destination), 7.into());
        assert_eq!(outcome.amount_for(HOLDER, p[1].destination), 8.into());
    }
    // Nothing touched the chain for the funded channel.
    assert!(s.chain.status(id).holdings.is_empty());

    s.alice.update_channel(id, s.outcome(1, 4), vec![]).await.unwrap();
    s.bob.update_channel(id, s.outcome(1, 4), vec![]).await.unwrap();
    s.settle().await;

    let close = s.alice.close_channel(id).await.unwrap();
    s.settle().await;
    s.bob.approve_objective(&close).await.unwrap();
    s.settle().await;

    for engine in [&s.alice, &s.bob] {
        assert_eq!(status(engine, &close), ObjectiveStatus::Succeeded);
        let outcome = engine.supported_state(ledger).unwrap().state.outcome;
        assert!(outcome.amount_for(HOLDER, id).is_zero());
        assert_eq!(outcome.amount_for(HOLDER, p[0].destination), 8.into());
        assert_eq!(outcome.amount_for(HOLDER, p[1].destination), 12.into());
    }
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_challenged() {
    let s = setup();
    let id = s.open_direct(NULL_APP, 6, 4).await;

    // Bob stops answering, Alice's close never completes.
    let close = s.alice.close_channel(id).await.unwrap();
    s.settle().await;
    assert_eq!(status(&s.alice, &close), ObjectiveStatus::Approved);

    let alice = s.alice.clone();
    let challenge = tokio::spawn(async move { alice.challenge(id).await });
    while !s.chain.status(id).challenge_registered() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    s.chain.advance_time(100);

    assert_eq!(
        challenge.await.unwrap().unwrap(),
        ChallengeState::Done(ChallengeOutcome::Finalized)
    );
    let p = s.participants();
    assert_eq!(s.chain.payout(HOLDER, p[0].destination), 6.into());
    assert_eq!(s.chain.payout(HOLDER, p[1].destination), 4.into());
    assert_eq!(
        status(&s.alice, &close),
        ObjectiveStatus::Failed("channel finalized by a challenge".into())
    );
}
