mod common;

use foreman_core::blocker::ResolveOutcome;
use foreman_core::domain::{BlockerStatus, BlockerType, WorkerId};
use foreman_core::ForemanConfig;

use common::world;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolves_have_exactly_one_winner() {
    let w = world(ForemanConfig::default(), &[]);
    let c = w.coordinator().clone();
    let blocker = c
        .create_blocker(WorkerId::from_raw(7), None, BlockerType::Async, "which license?")
        .await
        .unwrap();

    let mut joins = Vec::new();
    for i in 0..16 {
        let c = c.clone();
        let id = blocker.id;
        joins.push(tokio::spawn(async move {
            let answer = format!("answer-{i}");
            let outcome = c.resolve_blocker(id, &answer).await.unwrap();
            (answer, outcome)
        }));
    }

    let mut winners = Vec::new();
    for j in joins {
        let (answer, outcome) = j.await.unwrap();
        match outcome {
            ResolveOutcome::Resolved(b) => {
                assert_eq!(b.answer.as_deref(), Some(answer.as_str()));
                winners.push(answer);
            }
            ResolveOutcome::AlreadyResolved { status } => assert_eq!(status, BlockerStatus::Resolved),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = c.blockers().get(blocker.id).await.unwrap();
    assert_eq!(stored.status, BlockerStatus::Resolved);
    assert_eq!(stored.answer.as_deref(), Some(winners[0].as_str()));
}

#[tokio::test]
async fn expiring_twice_expires_each_blocker_once() {
    let w = world(ForemanConfig::default(), &[]);
    let c = w.coordinator();
    for n in 1..=3u128 {
        c.create_blocker(WorkerId::from_raw(n), None, BlockerType::Sync, "still there?")
            .await
            .unwrap();
    }
    let fresh = c
        .create_blocker(WorkerId::from_raw(9), None, BlockerType::Async, "later")
        .await
        .unwrap();

    w.clock.advance(chrono::Duration::hours(25));
    let late = c
        .create_blocker(WorkerId::from_raw(10), None, BlockerType::Async, "just asked")
        .await
        .unwrap();

    let first = c.expire_stale_blockers().await;
    let second = c.expire_stale_blockers().await;
    assert_eq!(first.len(), 4);
    assert!(first.contains(&fresh.id));
    assert!(second.is_empty());
    assert!(c.blockers().get(late.id).await.unwrap().is_pending());

    let stats = c.blockers().stats().await;
    assert_eq!(stats.expired, 4);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn resolving_an_expired_blocker_reports_the_conflict() {
    let w = world(ForemanConfig::default(), &[]);
    let c = w.coordinator();
    let blocker = c
        .create_blocker(WorkerId::from_raw(1), None, BlockerType::Sync, "ship it?")
        .await
        .unwrap();
    w.clock.advance(chrono::Duration::hours(25));
    c.expire_stale_blockers().await;

    let outcome = c.resolve_blocker(blocker.id, "yes").await.unwrap();
    assert_eq!(
        outcome,
        ResolveOutcome::AlreadyResolved {
            status: BlockerStatus::Expired
        }
    );
}
