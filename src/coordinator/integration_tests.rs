//! End-to-end coordinator scenarios
//!
//! Real catalog, state machine and ticket pool against the in-memory or file
//! store and the scripted participant client. Restart scenarios run each
//! process on its own runtime and shut it down to kill the first one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::catalog::{CoordinatorCatalog, RecoveryReport};
use super::document::CoordinatorDocument;
use super::error::CoordinatorError;
use super::gate::TicketPool;
use super::participant::{MockParticipantClient, MockVote};
use super::retry::{DeliveryPolicy, RetryConfig};
use super::state::CoordinatorState;
use super::store::{DocumentStore, FileDocumentStore, InMemoryDocumentStore};
use super::types::{Decision, DecisionMessage, ParticipantId, Timestamp, TxnId};
use crate::config::CoordinatorConfig;

struct Harness {
    catalog: CoordinatorCatalog,
    store: Arc<InMemoryDocumentStore>,
    gate: Arc<TicketPool>,
    client: Arc<MockParticipantClient>,
}

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        write_tickets: 4,
        transaction_lifetime_limit_ms: None,
        retry: RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        },
        delivery: DeliveryPolicy::RetryForever,
    }
}

/// Fresh process over `store`; a shared store survives a simulated restart
fn boot(store: Arc<InMemoryDocumentStore>, config: CoordinatorConfig) -> Harness {
    let gate = Arc::new(TicketPool::new(config.write_tickets));
    let client = Arc::new(MockParticipantClient::new());
    client.watch_store(store.clone());
    let catalog = CoordinatorCatalog::new(store.clone(), gate.clone(), client.clone(), config);
    Harness {
        catalog,
        store,
        gate,
        client,
    }
}

fn harness() -> Harness {
    boot(Arc::new(InMemoryDocumentStore::new()), test_config())
}

fn shards(n: usize) -> Vec<ParticipantId> {
    (1..=n).map(|i| ParticipantId::new(format!("shard-{}", i))).collect()
}

async fn wait_for_state(h: &Harness, txn: TxnId, state: CoordinatorState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.catalog.get(txn).map(|c| c.state()) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_all_participants_vote_commit() {
    let h = harness();
    let txn = TxnId::random(1);
    let handle = h.catalog.create_coordinator(txn, shards(3)).unwrap();

    assert_eq!(handle.run_commit().await.unwrap(), Decision::Commit);
    assert_eq!(handle.on_completion().await.unwrap(), Decision::Commit);

    for shard in ["shard-1", "shard-2", "shard-3"] {
        assert!(matches!(
            h.client.acknowledged(txn, shard),
            Some(DecisionMessage::Commit { .. })
        ));
    }
    assert!(h.store.get(txn).await.unwrap().is_none());
    assert!(!h.client.delivered_before_durable());
    assert_eq!(h.gate.available(), h.gate.capacity());
}

#[tokio::test]
async fn test_single_abort_vote_aborts_everyone() {
    let h = harness();
    h.client.set_vote("shard-2", MockVote::Abort);
    let txn = TxnId::random(2);
    let handle = h.catalog.create_coordinator(txn, shards(3)).unwrap();

    assert_eq!(handle.on_completion().await.unwrap(), Decision::Abort);
    for shard in ["shard-1", "shard-2", "shard-3"] {
        assert_eq!(h.client.acknowledged(txn, shard), Some(DecisionMessage::Abort));
    }
    assert!(h.store.is_empty());
    assert!(!h.client.delivered_before_durable());
}

#[tokio::test]
async fn test_unreachable_participant_counts_as_abort() {
    let h = harness();
    h.client.set_vote("shard-3", MockVote::TransportFailure);
    let txn = TxnId::random(3);
    let handle = h.catalog.create_coordinator(txn, shards(3)).unwrap();

    assert_eq!(handle.on_completion().await.unwrap(), Decision::Abort);
    assert_eq!(h.client.acknowledged_count(txn), 3);
}

#[tokio::test]
async fn test_cancel_during_vote_collection() {
    let h = harness();
    h.client.set_vote("shard-3", MockVote::Hang);
    let txn = TxnId::random(4);
    let handle = h.catalog.create_coordinator(txn, shards(3)).unwrap();

    h.client.wait_for_votes(2).await;
    assert_eq!(handle.state(), CoordinatorState::CollectingVotes);
    assert!(handle.cancel());

    assert_eq!(handle.run_commit().await.unwrap(), Decision::Abort);
    assert_eq!(handle.on_completion().await.unwrap(), Decision::Abort);
    assert_eq!(h.client.acknowledged(txn, "shard-3"), Some(DecisionMessage::Abort));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_cancel_while_gate_exhausted() {
    let h = boot(
        Arc::new(InMemoryDocumentStore::new()),
        CoordinatorConfig {
            write_tickets: 1,
            ..test_config()
        },
    );
    // an unrelated writer holds the only ticket
    let unrelated = h.gate.try_acquire().unwrap();
    let txn = TxnId::random(5);
    let handle = h.catalog.create_coordinator(txn, shards(2)).unwrap();

    wait_for_state(&h, txn, CoordinatorState::PersistingParticipants).await;
    assert!(handle.cancel());
    wait_for_state(&h, txn, CoordinatorState::PersistingDecision).await;
    drop(unrelated);

    assert_eq!(handle.on_completion().await.unwrap(), Decision::Abort);
    assert_eq!(h.client.prepare_count(), 0);
    assert_eq!(h.client.acknowledged_count(txn), 2);
    assert!(h.store.is_empty());
    assert_eq!(h.gate.available(), 1);
}

#[tokio::test]
async fn test_ack_failures_still_reach_cleanup() {
    let h = harness();
    h.client.fail_decisions("shard-2", 3);
    let txn = TxnId::random(6);
    let handle = h.catalog.create_coordinator(txn, shards(3)).unwrap();

    // the decision is known while delivery is still retrying
    assert_eq!(handle.run_commit().await.unwrap(), Decision::Commit);
    assert_eq!(handle.on_completion().await.unwrap(), Decision::Commit);

    assert_eq!(h.client.decision_attempts("shard-2"), 4);
    assert_eq!(h.client.decision_attempts("shard-1"), 1);
    assert!(matches!(
        h.client.acknowledged(txn, "shard-2"),
        Some(DecisionMessage::Commit { .. })
    ));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_cancel_after_decision_is_ignored() {
    let h = harness();
    h.client.set_vote("shard-1", MockVote::Commit(Timestamp::new(7, 3)));
    h.client.fail_decisions("shard-1", 20);
    let txn = TxnId::random(7);
    let handle = h.catalog.create_coordinator(txn, shards(2)).unwrap();

    wait_for_state(&h, txn, CoordinatorState::DeliveringDecision).await;
    assert!(!handle.cancel());

    assert_eq!(handle.on_completion().await.unwrap(), Decision::Commit);
    let expected = DecisionMessage::Commit {
        commit_timestamp: Timestamp::new(7, 3),
    };
    assert_eq!(h.client.acknowledged(txn, "shard-1"), Some(expected));
    assert_eq!(h.client.acknowledged(txn, "shard-2"), Some(expected));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_duplicate_create_returns_existing() {
    let h = harness();
    h.client.set_vote("shard-1", MockVote::Hang);
    let txn = TxnId::random(8);

    let first = h.catalog.create_coordinator(txn, shards(2)).unwrap();
    let second = h.catalog.create_coordinator(txn, shards(3)).unwrap();
    assert_eq!(second.participants().len(), 2);
    assert_eq!(h.catalog.len(), 1);

    second.cancel();
    assert_eq!(first.on_completion().await.unwrap(), Decision::Abort);
    assert!(h.catalog.is_empty());
}

#[tokio::test]
async fn test_bounded_delivery_keeps_document() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let h = boot(
        store.clone(),
        CoordinatorConfig {
            delivery: DeliveryPolicy::GiveUpAfter { attempts: 3 },
            ..test_config()
        },
    );
    h.client.fail_decisions("shard-2", u32::MAX);
    let txn = TxnId::random(9);
    let handle = h.catalog.create_coordinator(txn, shards(2)).unwrap();

    match handle.on_completion().await {
        Err(CoordinatorError::DeliveryAbandoned {
            participant,
            attempts,
        }) => {
            assert_eq!(participant.as_str(), "shard-2");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected abandoned delivery, got {:?}", other),
    }
    let kept = store.get(txn).await.unwrap().unwrap();
    assert_eq!(kept.decision, Some(Decision::Commit));
    assert!(h.catalog.is_empty());

    // the next process picks the document up again
    let restarted = boot(store.clone(), test_config());
    let report = restarted.catalog.recover_all().await.unwrap();
    assert_eq!(report.resumed_delivery, 1);
    restarted.catalog.join_all().await;
    assert_eq!(restarted.client.prepare_count(), 0);
    assert!(store.is_empty());
}

/// Votes every process in the restart scenarios agrees on
fn script_votes(client: &MockParticipantClient) {
    client.set_vote("shard-1", MockVote::Commit(Timestamp::new(3, 1)));
    client.set_vote("shard-2", MockVote::Commit(Timestamp::new(5, 0)));
    client.set_vote("shard-3", MockVote::Commit(Timestamp::new(2, 0)));
    client.set_vote("shard-4", MockVote::Commit(Timestamp::new(4, 2)));
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn acknowledged_by(
    client: &MockParticipantClient,
    txn: TxnId,
    participants: &[ParticipantId],
) -> Vec<Option<DecisionMessage>> {
    participants
        .iter()
        .map(|p| client.acknowledged(txn, p.as_str()))
        .collect()
}

#[test]
fn test_recovery_after_restart_matches_uninterrupted_run() {
    let undecided = TxnId::random(10);
    let undecided_shards = vec![ParticipantId::new("shard-1"), ParticipantId::new("shard-2")];
    let decided = TxnId::random(11);
    let decided_shards = vec![ParticipantId::new("shard-3"), ParticipantId::new("shard-4")];

    // reference: the same transactions with nothing going wrong
    let reference = runtime().block_on(async {
        let h = harness();
        script_votes(&h.client);
        let a = h.catalog.create_coordinator(undecided, undecided_shards.clone()).unwrap();
        let b = h.catalog.create_coordinator(decided, decided_shards.clone()).unwrap();
        assert_eq!(a.on_completion().await.unwrap(), Decision::Commit);
        assert_eq!(b.on_completion().await.unwrap(), Decision::Commit);
        (
            acknowledged_by(&h.client, undecided, &undecided_shards),
            acknowledged_by(&h.client, decided, &decided_shards),
        )
    });

    let store = Arc::new(InMemoryDocumentStore::new());

    // first process dies with one transaction voting and one delivering
    let crashed_rt = runtime();
    let crashed = crashed_rt.block_on(async {
        let h = boot(store.clone(), test_config());
        script_votes(&h.client);
        h.client.set_vote("shard-2", MockVote::Hang);
        h.client.fail_decisions("shard-4", u32::MAX);
        h.catalog.create_coordinator(undecided, undecided_shards.clone()).unwrap();
        h.catalog.create_coordinator(decided, decided_shards.clone()).unwrap();
        wait_for_state(&h, undecided, CoordinatorState::CollectingVotes).await;
        wait_for_state(&h, decided, CoordinatorState::DeliveringDecision).await;
        h.client.wait_for_votes(3).await;
        h
    });
    crashed_rt.shutdown_timeout(Duration::from_millis(100));
    assert_eq!(crashed.client.acknowledged(decided, "shard-4"), None);
    drop(crashed);

    assert_eq!(store.len(), 2);

    let (recovered, report, client) = runtime().block_on(async {
        let h = boot(store.clone(), test_config());
        script_votes(&h.client);
        let report = h.catalog.recover_all().await.unwrap();
        h.catalog.join_all().await;
        (
            (
                acknowledged_by(&h.client, undecided, &undecided_shards),
                acknowledged_by(&h.client, decided, &decided_shards),
            ),
            report,
            h.client,
        )
    });

    assert_eq!(
        report,
        RecoveryReport {
            resumed_voting: 1,
            resumed_delivery: 1,
            skipped: 0,
        }
    );
    assert_eq!(recovered, reference);
    assert_eq!(
        reference.0,
        vec![
            Some(DecisionMessage::Commit {
                commit_timestamp: Timestamp::new(5, 0)
            });
            2
        ]
    );
    // only the undecided transaction prepares again
    assert_eq!(client.prepare_count(), 2);
    assert!(!client.delivered_before_durable());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_recovery_resumes_persisted_abort() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let txn = TxnId::random(12);
    let document = CoordinatorDocument::new(txn, shards(3))
        .unwrap()
        .with_decision(DecisionMessage::Abort);
    store.put(&document).await.unwrap();

    let h = boot(store.clone(), test_config());
    let report = h.catalog.recover_all().await.unwrap();
    assert_eq!(report.resumed_delivery, 1);
    h.catalog.join_all().await;

    for shard in ["shard-1", "shard-2", "shard-3"] {
        assert_eq!(h.client.acknowledged(txn, shard), Some(DecisionMessage::Abort));
    }
    assert_eq!(h.client.prepare_count(), 0);
    assert!(store.is_empty());
}

fn file_store_dir(name: &str) -> PathBuf {
    let dir = PathBuf::from(format!("target/test_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn file_catalog(store: Arc<FileDocumentStore>) -> (CoordinatorCatalog, Arc<MockParticipantClient>) {
    let client = Arc::new(MockParticipantClient::new());
    client.watch_store(store.clone());
    let catalog = CoordinatorCatalog::new(
        store,
        Arc::new(TicketPool::new(4)),
        client.clone(),
        test_config(),
    );
    (catalog, client)
}

#[test]
fn test_restart_on_reopened_file_store() {
    let dir = file_store_dir("restart");
    let txn = TxnId::random(13);

    let crashed_rt = runtime();
    crashed_rt.block_on(async {
        let store = Arc::new(FileDocumentStore::open(&dir).unwrap());
        let (catalog, client) = file_catalog(store.clone());
        client.set_vote("shard-2", MockVote::Hang);
        let handle = catalog.create_coordinator(txn, shards(2)).unwrap();
        client.wait_for_votes(1).await;
        assert_eq!(handle.state(), CoordinatorState::CollectingVotes);
        assert_eq!(store.get(txn).await.unwrap().unwrap().decision, None);
    });
    crashed_rt.shutdown_timeout(Duration::from_millis(100));

    runtime().block_on(async {
        let store = Arc::new(FileDocumentStore::open(&dir).unwrap());
        let (catalog, client) = file_catalog(store.clone());
        client.set_vote("shard-2", MockVote::Commit(Timestamp::new(6, 0)));

        let report = catalog.recover_all().await.unwrap();
        assert_eq!(report.resumed_voting, 1);
        assert_eq!(report.total(), 1);
        catalog.join_all().await;

        for shard in ["shard-1", "shard-2"] {
            assert_eq!(
                client.acknowledged(txn, shard),
                Some(DecisionMessage::Commit {
                    commit_timestamp: Timestamp::new(6, 0)
                })
            );
        }
        assert!(!client.delivered_before_durable());
        assert!(store.scan_all().await.unwrap().documents.is_empty());
    });

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_recovery_skips_corrupt_record_and_resumes_healthy_one() {
    let dir = file_store_dir("recover_corrupt");
    let store = Arc::new(FileDocumentStore::open(&dir).unwrap());
    let healthy = TxnId::random(14);
    let expected = DecisionMessage::Commit {
        commit_timestamp: Timestamp::new(8, 0),
    };
    store
        .put(&CoordinatorDocument::new(healthy, shards(2)).unwrap().with_decision(expected))
        .await
        .unwrap();

    let damaged = TxnId::random(15);
    store
        .put(&CoordinatorDocument::new(damaged, shards(2)).unwrap())
        .await
        .unwrap();
    let damaged_path = dir.join(format!("{}.doc", damaged.storage_key()));
    let mut bytes = std::fs::read(&damaged_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&damaged_path, bytes).unwrap();

    let (catalog, client) = file_catalog(store.clone());
    let report = catalog.recover_all().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            resumed_voting: 0,
            resumed_delivery: 1,
            skipped: 1,
        }
    );
    catalog.join_all().await;

    for shard in ["shard-1", "shard-2"] {
        assert_eq!(client.acknowledged(healthy, shard), Some(expected));
    }
    assert_eq!(client.acknowledged_count(damaged), 0);
    assert!(store.get(healthy).await.unwrap().is_none());
    // left for an operator
    assert!(damaged_path.exists());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_many_transactions_share_small_gate() {
    let h = boot(
        Arc::new(InMemoryDocumentStore::new()),
        CoordinatorConfig {
            write_tickets: 2,
            ..test_config()
        },
    );
    h.store.fail_next_puts(5);

    let handles: Vec<_> = (0..32)
        .map(|n| h.catalog.create_coordinator(TxnId::random(n), shards(3)).unwrap())
        .collect();
    for handle in &handles {
        assert_eq!(handle.on_completion().await.unwrap(), Decision::Commit);
    }

    assert!(h.catalog.is_empty());
    assert!(h.store.is_empty());
    assert_eq!(h.gate.available(), 2);
    assert_eq!(h.catalog.metrics().active(), 0);
    assert!(!h.client.delivered_before_durable());
}

#[tokio::test]
async fn test_commit_over_channel_transport() {
    use super::channel::{ChannelParticipantClient, ParticipantRequest};
    use super::types::Vote;

    let store = Arc::new(InMemoryDocumentStore::new());
    let client = Arc::new(ChannelParticipantClient::new(Duration::from_secs(1)));
    let (acks_tx, mut acks_rx) = tokio::sync::mpsc::unbounded_channel();

    for (n, participant) in shards(3).into_iter().enumerate() {
        let mut endpoint = client.register(participant.clone(), 4);
        let acks_tx = acks_tx.clone();
        tokio::spawn(async move {
            while let Some(request) = endpoint.recv().await {
                match request {
                    ParticipantRequest::Prepare { reply, .. } => {
                        let _ = reply.send(Vote::Commit {
                            prepare_timestamp: Timestamp::new(10, n as u32),
                        });
                    }
                    ParticipantRequest::Decision {
                        decision, reply, ..
                    } => {
                        let _ = acks_tx.send((participant.clone(), decision));
                        let _ = reply.send(());
                    }
                }
            }
        });
    }
    drop(acks_tx);

    let catalog = CoordinatorCatalog::new(
        store.clone(),
        Arc::new(TicketPool::new(4)),
        client.clone(),
        test_config(),
    );
    let handle = catalog.create_coordinator(TxnId::random(1), shards(3)).unwrap();
    assert_eq!(handle.on_completion().await.unwrap(), Decision::Commit);

    let mut acks = Vec::new();
    for _ in 0..3 {
        acks.push(acks_rx.recv().await.unwrap());
    }
    acks.sort_by(|a, b| a.0.cmp(&b.0));
    let expected = DecisionMessage::Commit {
        commit_timestamp: Timestamp::new(10, 2),
    };
    assert_eq!(
        acks,
        shards(3).into_iter().map(|p| (p, expected)).collect::<Vec<_>>()
    );
    assert!(store.is_empty());
}
