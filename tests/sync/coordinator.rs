//! SyncCoordinator tests: write, read and delete paths plus replay and session expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Barrier;

use lifeos_sync::auth::AuthProvider;
use lifeos_sync::error::RemoteError;
use lifeos_sync::remote::Filter;
use lifeos_sync::storage::LocalCache;
use lifeos_sync::sync::{ConnectivityState, SyncEvent, WriteOutcome};
use lifeos_sync::types::{is_local_id, CacheKey, User};

use crate::support::{network_error, record, test_config, title, titled, Harness, Op};

fn cached(h: &Harness, collection: &str) -> Vec<lifeos_sync::types::Record> {
    h.coordinator
        .cache()
        .get(&CacheKey::new(collection))
        .unwrap_or_default()
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn online_write_syncs_and_adopts_remote_id() {
    let h = Harness::new();
    let outcome = h.coordinator.write("todos", titled("buy milk")).await.unwrap();

    let stored = match outcome {
        WriteOutcome::Synced(stored) => stored,
        other => panic!("expected Synced, got {other:?}"),
    };
    assert_eq!(stored.id().as_deref(), Some("1"));

    let cache = cached(&h, "todos");
    assert_eq!(cache.len(), 1);
    assert_eq!(cache[0].id().as_deref(), Some("1"));
    assert_eq!(h.remote.rows("todos").len(), 1);
    assert_eq!(h.coordinator.pending_count(), 0);
}

#[tokio::test]
async fn cache_is_written_before_the_remote_call() {
    let h = Harness::new();
    let cache = LocalCache::new(h.store.clone(), None);
    let saw_cached = Arc::new(AtomicBool::new(false));
    let flag = saw_cached.clone();
    h.remote.fail_when(move |call| {
        let rows = cache.get(&CacheKey::new("todos")).unwrap_or_default();
        if call.op == Op::Write && rows.iter().any(|r| title(r) == Some("journal")) {
            flag.store(true, Ordering::SeqCst);
        }
        Some(network_error())
    });

    let outcome = h.coordinator.write("todos", titled("journal")).await.unwrap();

    assert!(saw_cached.load(Ordering::SeqCst));
    assert_eq!(outcome, WriteOutcome::Queued);
    assert_eq!(h.coordinator.pending_count(), 1);
    assert_eq!(cached(&h, "todos").len(), 1);
}

#[tokio::test]
async fn offline_write_is_cached_and_queued_without_remote_call() {
    let h = Harness::offline();
    let outcome = h.coordinator.write("todos", titled("a")).await.unwrap();

    assert_eq!(outcome, WriteOutcome::Queued);
    assert!(h.remote.calls().is_empty());
    let cache = cached(&h, "todos");
    assert_eq!(cache.len(), 1);
    assert!(is_local_id(&cache[0].id().unwrap()));
}

#[tokio::test]
async fn offline_writes_are_replayed_exactly_once() {
    let h = Harness::offline();
    for t in ["a", "b", "c"] {
        h.coordinator.write("todos", titled(t)).await.unwrap();
    }

    h.coordinator.set_online(true);
    assert_eq!(h.coordinator.state(), ConnectivityState::OnlineAuthenticated);

    let report = h.coordinator.drain().await;
    assert_eq!(report.applied, 3);
    assert_eq!(h.remote.rows("todos").len(), 3);

    let again = h.coordinator.drain().await;
    assert!(again.is_noop());
    assert_eq!(h.remote.count(Op::Write), 3);
    assert!(cached(&h, "todos")
        .iter()
        .all(|r| !is_local_id(&r.id().unwrap())));
}

#[tokio::test]
async fn queued_update_of_a_new_record_patches_the_inserted_row() {
    let h = Harness::offline();
    h.coordinator.write("todos", titled("draft")).await.unwrap();
    let local_id = cached(&h, "todos")[0].id().unwrap();

    h.coordinator
        .write("todos", record(json!({ "id": local_id, "title": "final" })))
        .await
        .unwrap();
    assert_eq!(cached(&h, "todos").len(), 1);

    h.coordinator.set_online(true);
    let report = h.coordinator.drain().await;
    assert_eq!(report.applied, 2);

    let rows = h.remote.rows("todos");
    assert_eq!(rows.len(), 1);
    assert_eq!(title(&rows[0]), Some("final"));

    let cache = cached(&h, "todos");
    assert_eq!(cache.len(), 1);
    assert_eq!(cache[0].id().as_deref(), Some("1"));
    assert_eq!(title(&cache[0]), Some("final"));
    assert_eq!(h.coordinator.resolve_id(&local_id), "1");
}

#[tokio::test]
async fn replay_after_partial_success_does_not_duplicate() {
    let h = Harness::offline();
    h.coordinator.write("todos", titled("a")).await.unwrap();
    h.coordinator.write("todos", titled("b")).await.unwrap();
    h.coordinator.set_online(true);

    h.remote.fail_when(|call| {
        (call.op == Op::Write && title(&call.record) == Some("b")).then(network_error)
    });
    let first = h.coordinator.drain().await;
    assert_eq!(first.applied, 1);
    assert_eq!(first.requeued, 1);

    h.remote.clear_failures();
    let second = h.coordinator.drain().await;
    assert_eq!(second.applied, 1);

    let mut titles: Vec<_> = h
        .remote
        .rows("todos")
        .iter()
        .map(|r| title(r).unwrap().to_string())
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["a", "b"]);
}

#[tokio::test]
async fn write_with_pending_changes_for_the_same_record_is_queued_behind_them() {
    let h = Harness::offline();
    h.coordinator.write("todos", titled("draft")).await.unwrap();
    let local_id = cached(&h, "todos")[0].id().unwrap();

    h.coordinator.set_online(true);
    let outcome = h
        .coordinator
        .write("todos", record(json!({ "id": local_id, "title": "edited" })))
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Queued);
    assert_eq!(h.remote.count(Op::Write), 0);
    h.coordinator.drain().await;
    assert_eq!(h.remote.rows("todos").len(), 1);
}

#[tokio::test]
async fn rejected_write_is_dead_lettered_and_reported() {
    let h = Harness::new();
    h.remote.fail_when(|_| {
        Some(RemoteError::Status {
            status: 422,
            body: "title too long".to_string(),
        })
    });
    let outcome = h.coordinator.write("todos", titled("x")).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Queued);

    let report = h.coordinator.drain().await;
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(h.coordinator.pending_count(), 0);
    assert_eq!(h.coordinator.dead_letters().len(), 1);
    assert_eq!(
        h.count_events(|e| matches!(e, SyncEvent::DeadLettered(_))),
        1
    );

    h.remote.clear_failures();
    assert_eq!(h.coordinator.retry_dead_letters().unwrap(), 1);
    let report = h.coordinator.drain().await;
    assert_eq!(report.applied, 1);
    assert!(h.coordinator.dead_letters().is_empty());
}

#[tokio::test]
async fn transient_failures_exhaust_the_retry_budget() {
    let h = Harness::new();
    h.remote.fail_when(|_| {
        Some(RemoteError::Status {
            status: 503,
            body: String::new(),
        })
    });
    h.coordinator.write("todos", titled("x")).await.unwrap();

    for _ in 0..2 {
        let report = h.coordinator.drain().await;
        assert_eq!(report.requeued, 1);
    }
    let last = h.coordinator.drain().await;
    assert_eq!(last.dead_lettered.len(), 1);
    assert_eq!(h.coordinator.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_remote_write_times_out_and_is_queued() {
    let mut config = test_config();
    config.request_timeout_ms = 50;
    let h = Harness::with(config, true);
    // Never released: the second party never arrives.
    h.remote.gate_writes(Arc::new(Barrier::new(2)));

    let outcome = h.coordinator.write("todos", titled("slow")).await.unwrap();

    assert_eq!(outcome, WriteOutcome::Queued);
    let pending = h.coordinator.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(cached(&h, "todos").len(), 1);
}

#[tokio::test]
async fn entries_queued_by_another_user_are_not_replayed() {
    let h = Harness::offline();
    h.coordinator.write("todos", titled("mine")).await.unwrap();

    h.coordinator.logout();
    h.auth.sign_in(User::new("u2"), "token-2");
    h.coordinator.login(User::new("u2"));
    h.coordinator.set_online(true);

    let report = h.coordinator.drain().await;
    assert_eq!(report.applied, 0);
    assert_eq!(report.dead_lettered.len(), 1);
    assert!(h.remote.rows("todos").is_empty());
}

// ============================================================================
// Deletes
// ============================================================================

#[tokio::test]
async fn online_delete_removes_locally_and_remotely() {
    let h = Harness::new();
    h.coordinator.write("todos", titled("a")).await.unwrap();

    let outcome = h.coordinator.delete("todos", "1").await.unwrap();

    assert_eq!(outcome, WriteOutcome::Deleted);
    assert!(h.remote.rows("todos").is_empty());
    assert!(cached(&h, "todos").is_empty());
}

#[tokio::test]
async fn offline_delete_is_replayed() {
    let h = Harness::new();
    h.coordinator.write("todos", titled("a")).await.unwrap();
    h.coordinator.set_online(false);

    let outcome = h.coordinator.delete("todos", "1").await.unwrap();
    assert_eq!(outcome, WriteOutcome::Queued);
    assert_eq!(h.remote.rows("todos").len(), 1);

    h.coordinator.set_online(true);
    h.coordinator.drain().await;
    assert!(h.remote.rows("todos").is_empty());
}

#[tokio::test]
async fn deleting_an_unsynced_record_replays_insert_then_delete() {
    let h = Harness::offline();
    h.coordinator.write("todos", titled("temp")).await.unwrap();
    let local_id = cached(&h, "todos")[0].id().unwrap();

    let outcome = h.coordinator.delete("todos", &local_id).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Queued);
    assert!(cached(&h, "todos").is_empty());

    h.coordinator.set_online(true);
    let report = h.coordinator.drain().await;
    assert_eq!(report.applied, 2);
    assert!(h.remote.rows("todos").is_empty());
}

#[tokio::test]
async fn deleting_a_local_only_record_never_touches_the_remote() {
    let h = Harness::new();
    h.coordinator
        .cache()
        .put(
            &CacheKey::new("todos"),
            vec![record(json!({ "id": "local-abc", "title": "ghost" }))],
        )
        .unwrap();

    let outcome = h.coordinator.delete("todos", "local-abc").await.unwrap();

    assert_eq!(outcome, WriteOutcome::LocalOnly);
    assert!(h.remote.calls().is_empty());
    assert!(cached(&h, "todos").is_empty());
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn online_read_returns_remote_rows_and_refreshes_cache() {
    let h = Harness::new();
    h.remote.seed(
        "notes",
        vec![
            json!({ "id": 1, "category": "work", "title": "standup" }),
            json!({ "id": 2, "category": "home", "title": "groceries" }),
        ],
    );
    let key = CacheKey::scoped("notes", "work");
    let filter = Filter::all().eq("category", "work");

    let rows = h.coordinator.read(&key, &filter).await;

    assert_eq!(rows.len(), 1);
    assert_eq!(title(&rows[0]), Some("standup"));
    let snapshot = h.coordinator.cache().get(&key).unwrap();
    assert_eq!(snapshot, rows);
}

#[tokio::test]
async fn read_falls_back_to_filtered_cache_when_offline_or_failing() {
    let h = Harness::new();
    h.remote.seed(
        "todos",
        vec![
            json!({ "id": 1, "done": false, "title": "a" }),
            json!({ "id": 2, "done": true, "title": "b" }),
        ],
    );
    h.coordinator.read("todos", &Filter::all()).await;

    h.coordinator.set_online(false);
    let open = h
        .coordinator
        .read("todos", &Filter::all().eq("done", false))
        .await;
    assert_eq!(open.len(), 1);
    assert_eq!(title(&open[0]), Some("a"));

    h.coordinator.set_online(true);
    h.remote.fail_when(|_| Some(network_error()));
    let all = h.coordinator.read("todos", &Filter::all()).await;
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn read_with_nothing_cached_and_no_remote_is_empty() {
    let h = Harness::offline();
    assert!(h.coordinator.read("journal", &Filter::all()).await.is_empty());
}

#[tokio::test]
async fn refresh_keeps_pending_offline_edits_visible() {
    let h = Harness::offline();
    h.remote.seed("todos", vec![json!({ "id": 1, "title": "remote" })]);
    h.coordinator.write("todos", titled("offline edit")).await.unwrap();

    // Online but not yet drained.
    h.coordinator.set_online(true);
    let rows = h.coordinator.read("todos", &Filter::all()).await;

    let titles: Vec<_> = rows.iter().filter_map(title).collect();
    assert!(titles.contains(&"remote"));
    assert!(titles.contains(&"offline edit"));
}

#[tokio::test]
async fn write_updates_matching_records_in_scoped_snapshots() {
    let h = Harness::new();
    h.remote
        .seed("notes", vec![json!({ "id": 1, "category": "work", "title": "old" })]);
    let work = CacheKey::scoped("notes", "work");
    h.coordinator
        .read(&work, &Filter::all().eq("category", "work"))
        .await;

    h.coordinator
        .write("notes", record(json!({ "id": 1, "category": "work", "title": "new" })))
        .await
        .unwrap();

    let snapshot = h.coordinator.cache().get(&work).unwrap();
    assert_eq!(title(&snapshot[0]), Some("new"));
}

// ============================================================================
// Session expiry
// ============================================================================

#[tokio::test]
async fn concurrent_auth_expiry_tears_the_session_down_once() {
    let h = Harness::new();
    h.remote.gate_writes(Arc::new(Barrier::new(3)));
    h.remote.fail_when(|call| (call.op == Op::Write).then_some(RemoteError::AuthExpired));

    let c = &h.coordinator;
    let (a, b, d) = tokio::join!(
        c.write("todos", titled("a")),
        c.write("todos", titled("b")),
        c.write("todos", titled("c")),
    );

    for outcome in [a, b, d] {
        assert_eq!(outcome.unwrap(), WriteOutcome::Queued);
    }
    assert_eq!(h.auth.clear_count(), 1);
    assert_eq!(h.count_events(|e| matches!(e, SyncEvent::SessionExpired)), 1);
    assert_eq!(
        h.coordinator.state(),
        ConnectivityState::OnlineUnauthenticated
    );
    assert_eq!(h.coordinator.pending_count(), 3);
}

#[tokio::test]
async fn no_remote_calls_after_session_expiry_until_login() {
    let h = Harness::new();
    h.remote
        .fail_when(|call| (call.op == Op::Write).then_some(RemoteError::AuthExpired));
    h.coordinator.write("todos", titled("a")).await.unwrap();
    let calls = h.remote.calls().len();

    h.coordinator.write("todos", titled("b")).await.unwrap();
    assert!(h.coordinator.drain().await.is_noop());
    assert_eq!(h.remote.calls().len(), calls);
    assert_eq!(h.coordinator.pending_count(), 2);

    h.remote.clear_failures();
    h.auth.sign_in(User::new("u1"), "token-2");
    h.coordinator.login(User::new("u1"));
    let report = h.coordinator.drain().await;
    assert_eq!(report.applied, 2);
}

#[tokio::test]
async fn late_auth_failure_from_an_old_session_keeps_the_new_one() {
    let h = Harness::new();
    let gate = Arc::new(Barrier::new(2));
    h.remote.gate_writes(gate.clone());
    h.remote.fail_when(|_| Some(RemoteError::AuthExpired));

    let c = &h.coordinator;
    let (stale, ()) = tokio::join!(c.write("todos", titled("stale")), async {
        // Expires the session while the write is still in flight.
        c.read("todos", &Filter::all()).await;
        assert_eq!(h.auth.clear_count(), 1);

        h.auth.sign_in(User::new("u1"), "token-2");
        c.login(User::new("u1"));
        assert_eq!(c.state(), ConnectivityState::OnlineAuthenticated);

        gate.wait().await;
    });

    assert_eq!(stale.unwrap(), WriteOutcome::Queued);
    assert_eq!(h.auth.clear_count(), 1);
    assert!(h.auth.is_authenticated());
    assert_eq!(h.coordinator.state(), ConnectivityState::OnlineAuthenticated);
    assert_eq!(h.count_events(|e| matches!(e, SyncEvent::SessionExpired)), 1);
    assert_eq!(h.coordinator.pending()[0].owner.as_deref(), Some("u1"));
}

#[tokio::test]
async fn write_rejected_for_expired_auth_stays_with_its_user() {
    let h = Harness::new();
    h.remote
        .fail_when(|call| (call.op == Op::Write).then_some(RemoteError::AuthExpired));

    let outcome = h.coordinator.write("todos", titled("mine")).await.unwrap();

    assert_eq!(outcome, WriteOutcome::Queued);
    assert_eq!(h.coordinator.current_user(), None);
    assert_eq!(h.coordinator.pending()[0].owner.as_deref(), Some("u1"));

    h.remote.clear_failures();
    h.auth.sign_in(User::new("u2"), "token-2");
    h.coordinator.login(User::new("u2"));
    let report = h.coordinator.drain().await;

    assert_eq!(report.applied, 0);
    assert_eq!(report.dead_lettered.len(), 1);
    assert!(h.remote.rows("todos").is_empty());
}

#[tokio::test]
async fn delete_rejected_for_expired_auth_stays_with_its_user() {
    let h = Harness::new();
    h.coordinator.write("todos", titled("a")).await.unwrap();
    h.remote
        .fail_when(|call| (call.op == Op::Remove).then_some(RemoteError::AuthExpired));

    let outcome = h.coordinator.delete("todos", "1").await.unwrap();

    assert_eq!(outcome, WriteOutcome::Queued);
    assert_eq!(h.coordinator.pending()[0].owner.as_deref(), Some("u1"));

    h.remote.clear_failures();
    h.auth.sign_in(User::new("u2"), "token-2");
    h.coordinator.login(User::new("u2"));
    let report = h.coordinator.drain().await;

    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(h.remote.rows("todos").len(), 1);
}

#[tokio::test]
async fn auth_expiry_mid_drain_halts_and_keeps_order() {
    let h = Harness::offline();
    for t in ["a", "b", "c"] {
        h.coordinator.write("todos", titled(t)).await.unwrap();
    }
    h.coordinator.set_online(true);
    h.remote.fail_when(|call| {
        (title(&call.record) == Some("b")).then_some(RemoteError::AuthExpired)
    });

    let report = h.coordinator.drain().await;

    assert!(report.halted);
    assert_eq!(report.applied, 1);
    let pending: Vec<_> = h
        .coordinator
        .pending()
        .iter()
        .map(|e| title(&e.payload).unwrap().to_string())
        .collect();
    assert_eq!(pending, vec!["b", "c"]);
    assert_eq!(h.auth.clear_count(), 1);
}

// ============================================================================
// Signals and events
// ============================================================================

#[tokio::test]
async fn connectivity_changes_are_published() {
    let h = Harness::new();
    h.coordinator.set_online(false);
    h.coordinator.set_online(false);
    h.coordinator.set_online(true);

    let changes: Vec<_> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::StateChanged { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![
            (
                ConnectivityState::OnlineAuthenticated,
                ConnectivityState::Offline
            ),
            (
                ConnectivityState::Offline,
                ConnectivityState::OnlineAuthenticated
            ),
        ]
    );
}

#[tokio::test]
async fn queue_and_aliases_survive_restart() {
    let h = Harness::offline();
    h.coordinator.write("todos", titled("a")).await.unwrap();
    let local_id = cached(&h, "todos")[0].id().unwrap();
    h.coordinator.set_online(true);
    h.coordinator.drain().await;
    h.coordinator.set_online(false);
    h.coordinator
        .write("todos", record(json!({ "id": local_id, "title": "a2" })))
        .await
        .unwrap();

    let restarted = Harness::on_store(h.store.clone(), test_config(), true);
    assert_eq!(restarted.coordinator.pending_count(), 1);
    assert_eq!(restarted.coordinator.resolve_id(&local_id), "1");
}
