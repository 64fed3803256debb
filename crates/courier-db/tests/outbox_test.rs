//! Integration tests for the outbox event store and emission API.
//!
//! **IMPORTANT**: These tests require a migrated PostgreSQL database.
//! Run migrations first: `sqlx migrate run`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use courier_db::test_fixtures::TestDatabase;
use courier_db::{
    EntryTransition, Error, NewOutboxEvent, OutboxEntry, OutboxRepository, OutboxStatus,
    OutboxTable, Result, SweepTrigger,
};

/// Trigger counting how often it was scheduled.
#[derive(Default)]
struct CountingTrigger {
    calls: AtomicUsize,
}

impl SweepTrigger for CountingTrigger {
    fn schedule(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Trigger that always fails.
struct BrokenTrigger;

impl SweepTrigger for BrokenTrigger {
    fn schedule(&self) -> Result<()> {
        Err(Error::Internal("executor unavailable".into()))
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_emit_defaults_and_due_immediately() {
    let test_db = TestDatabase::new().await;
    let outbox = test_db.db.outbox.clone();
    let aggregate_id = TestDatabase::aggregate_id();

    let before = Utc::now();
    let id = aggregate_id.clone();
    let entry = test_db
        .db
        .atomic(move |uow| {
            Box::pin(async move {
                outbox
                    .emit(uow, NewOutboxEvent::new("UploadFile", id, "file.stored"))
                    .await
            })
        })
        .await
        .unwrap();

    assert_eq!(entry.idempotency_key, format!("UploadFile:{}", aggregate_id));
    assert_eq!(entry.payload, json!({}));
    assert_eq!(entry.status, OutboxStatus::Pending);
    assert_eq!(entry.attempts, 0);
    assert_eq!(entry.max_attempts, 5);
    assert!(entry.next_attempt_at.unwrap() >= before - Duration::seconds(1));
    assert!(entry.is_due(Utc::now()));

    let stored = test_db.db.outbox.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.id, entry.id);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_duplicate_emit_fails_loudly_and_keeps_original() {
    let test_db = TestDatabase::new().await;
    let aggregate_id = TestDatabase::aggregate_id();

    let mut uow = test_db.db.begin().await.unwrap();
    let original = test_db
        .db
        .outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("UploadFile", aggregate_id.clone(), "file.stored")
                .with_payload(json!({"v": 1})),
        )
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let mut uow = test_db.db.begin().await.unwrap();
    let err = test_db
        .db
        .outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("UploadFile", aggregate_id.clone(), "file.stored")
                .with_payload(json!({"v": 2})),
        )
        .await
        .unwrap_err();
    assert!(err.is_duplicate_event(), "unexpected error: {}", err);

    // The savepoint keeps the unit of work usable after the duplicate.
    let n: i32 = sqlx::query_scalar("SELECT 1")
        .fetch_one(uow.conn())
        .await
        .unwrap();
    assert_eq!(n, 1);
    uow.rollback().await.unwrap();

    let stored = test_db.db.outbox.get(original.id).await.unwrap().unwrap();
    assert_eq!(stored.payload, json!({"v": 1}));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_trigger_fires_only_after_commit() {
    let test_db = TestDatabase::new().await;
    let trigger = Arc::new(CountingTrigger::default());
    let db = test_db.db.clone().with_trigger(trigger.clone());

    let mut uow = db.begin().await.unwrap();
    let entry = db
        .outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("UploadFile", TestDatabase::aggregate_id(), "file.stored"),
        )
        .await
        .unwrap();
    assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    assert_eq!(uow.pending_hooks(), 1);
    uow.commit().await.unwrap();
    assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
    assert!(db.outbox.get(entry.id).await.unwrap().is_some());

    // Rolled back: neither the entry nor the trigger survive.
    let mut uow = db.begin().await.unwrap();
    let dropped = db
        .outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("UploadFile", TestDatabase::aggregate_id(), "file.stored"),
        )
        .await
        .unwrap();
    drop(uow);
    assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
    assert!(db.outbox.get(dropped.id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_trigger_failure_does_not_fail_emit() {
    let test_db = TestDatabase::new().await;
    let db = test_db.db.clone().with_trigger(Arc::new(BrokenTrigger));
    let outbox = db.outbox.clone();

    let entry = db
        .atomic(move |uow| {
            Box::pin(async move {
                outbox
                    .emit(
                        uow,
                        NewOutboxEvent::new("UploadFile", TestDatabase::aggregate_id(), "file.stored"),
                    )
                    .await
            })
        })
        .await
        .unwrap();

    assert!(db.outbox.get(entry.id).await.unwrap().is_some());
}

/// Emit an entry and pin its schedule to `at`.
///
/// Sweep tests fetch with a `now` far in the past so they only ever see
/// entries they scheduled there themselves.
async fn scheduled_entry(test_db: &TestDatabase, at: DateTime<Utc>) -> OutboxEntry {
    let outbox = &test_db.db.outbox;
    let mut uow = test_db.db.begin().await.unwrap();
    let entry = outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("UploadFile", TestDatabase::aggregate_id(), "file.stored"),
        )
        .await
        .unwrap();
    sqlx::query("UPDATE outbox_event SET next_attempt_at = $2 WHERE id = $1")
        .bind(entry.id)
        .bind(at)
        .execute(uow.conn())
        .await
        .unwrap();
    uow.commit().await.unwrap();
    outbox.get(entry.id).await.unwrap().unwrap()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_fetch_due_skips_future_entries() {
    let test_db = TestDatabase::new().await;
    let outbox = &test_db.db.outbox;
    let now = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 1).unwrap();

    let due = scheduled_entry(&test_db, now - Duration::seconds(1)).await;
    let later = scheduled_entry(&test_db, now + Duration::hours(1)).await;

    let fetched = outbox
        .fetch_due(now, 10_000, Duration::minutes(5))
        .await
        .unwrap();
    let ids: Vec<_> = fetched.iter().map(|e| e.id).collect();
    assert!(ids.contains(&due.id));
    assert!(!ids.contains(&later.id));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_fetch_due_claims_entries_until_released() {
    let test_db = TestDatabase::new().await;
    let outbox = &test_db.db.outbox;
    let scheduled = Utc.with_ymd_and_hms(2000, 2, 1, 0, 0, 0).unwrap();
    let now = scheduled + Duration::seconds(1);
    let lease = Duration::minutes(5);

    let entry = scheduled_entry(&test_db, scheduled).await;

    let first = outbox.fetch_due(now, 10_000, lease).await.unwrap();
    let claimed = first
        .iter()
        .find(|e| e.id == entry.id)
        .cloned()
        .expect("due entry fetched");
    assert_eq!(claimed.attempts, 0);
    assert_eq!(claimed.next_attempt_at, Some(scheduled));

    // A second sweep running while the first delivers must not see it.
    let second = outbox.fetch_due(now, 10_000, lease).await.unwrap();
    assert!(second.iter().all(|e| e.id != entry.id));
    let stored = outbox.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.next_attempt_at, Some(now + lease));

    // Released unattempted, it is due again on its original schedule.
    assert_eq!(outbox.release(&[claimed.clone()]).await.unwrap(), 1);
    let stored = outbox.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.next_attempt_at, Some(scheduled));

    let third = outbox.fetch_due(now, 10_000, lease).await.unwrap();
    assert!(third.iter().any(|e| e.id == entry.id));

    // The claim leaves attempts alone, so the guarded write still lands.
    let delivered = EntryTransition {
        id: entry.id,
        previous_attempts: 0,
        attempts: 1,
        status: OutboxStatus::Delivered,
        next_attempt_at: None,
        delivered_at: Some(now),
        error_message: String::new(),
    };
    assert_eq!(
        outbox.apply_transitions(&[delivered]).await.unwrap(),
        vec![entry.id]
    );

    // A stale release cannot resurrect a settled entry.
    assert_eq!(outbox.release(&[claimed]).await.unwrap(), 0);
    let stored = outbox.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Delivered);
    assert!(stored.next_attempt_at.is_none());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_apply_transitions_guarded_by_attempts() {
    let test_db = TestDatabase::new().await;
    let outbox = &test_db.db.outbox;

    let mut uow = test_db.db.begin().await.unwrap();
    let entry = outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("UploadFile", TestDatabase::aggregate_id(), "file.stored"),
        )
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let now = Utc::now();
    let retry = EntryTransition {
        id: entry.id,
        previous_attempts: 0,
        attempts: 1,
        status: OutboxStatus::Pending,
        next_attempt_at: Some(now + Duration::seconds(60)),
        delivered_at: None,
        error_message: "HTTP 500: boom".to_string(),
    };
    assert_eq!(
        outbox.apply_transitions(&[retry.clone()]).await.unwrap(),
        vec![entry.id]
    );

    // A second sweep that saw attempts = 0 must not double-apply.
    assert!(outbox.apply_transitions(&[retry]).await.unwrap().is_empty());

    let stored = outbox.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error_message, "HTTP 500: boom");
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert!(!stored.is_due(now));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_requeue_failed_resets_entry() {
    let test_db = TestDatabase::new().await;
    let outbox = &test_db.db.outbox;

    let mut uow = test_db.db.begin().await.unwrap();
    let entry = outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("UploadFile", TestDatabase::aggregate_id(), "file.stored"),
        )
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let failed = EntryTransition {
        id: entry.id,
        previous_attempts: 0,
        attempts: 5,
        status: OutboxStatus::Failed,
        next_attempt_at: None,
        delivered_at: None,
        error_message: "ConnectError: refused".to_string(),
    };
    outbox.apply_transitions(&[failed]).await.unwrap();

    let now = Utc::now();
    assert_eq!(outbox.requeue_failed(&[entry.id], now).await.unwrap(), 1);
    // Already pending: nothing to do.
    assert_eq!(outbox.requeue_failed(&[entry.id], now).await.unwrap(), 0);

    let stored = outbox.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.attempts, 0);
    assert!(stored.error_message.is_empty());
    assert!(stored.is_due(now));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_cleanup_deletes_only_old_terminal_entries() {
    let test_db = TestDatabase::new().await;
    let outbox = &test_db.db.outbox;
    let long_ago = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
    let cutoff = Utc.with_ymd_and_hms(2001, 1, 2, 0, 0, 0).unwrap();

    let mut uow = test_db.db.begin().await.unwrap();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let entry = outbox
            .emit(
                &mut uow,
                NewOutboxEvent::new("UploadFile", TestDatabase::aggregate_id(), "file.stored"),
            )
            .await
            .unwrap();
        ids.push(entry.id);
    }
    // Two old delivered entries and one old pending entry.
    sqlx::query(
        "UPDATE outbox_event SET status = 'delivered', next_attempt_at = NULL, created_at = $2
         WHERE id = ANY($1)",
    )
    .bind(&ids[..2])
    .bind(long_ago)
    .execute(uow.conn())
    .await
    .unwrap();
    sqlx::query("UPDATE outbox_event SET created_at = $2 WHERE id = $1")
        .bind(ids[2])
        .bind(long_ago)
        .execute(uow.conn())
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let first = outbox.cleanup(cutoff, 1).await.unwrap();
    assert_eq!(first.deleted, 1);
    assert!(first.remaining >= 1);

    let second = outbox.cleanup(cutoff, 1000).await.unwrap();
    assert!(second.deleted >= 1);
    assert_eq!(second.remaining, 0);

    assert_eq!(outbox.cleanup(cutoff, 1000).await.unwrap().deleted, 0);
    assert!(outbox.get(ids[0]).await.unwrap().is_none());
    assert!(outbox.get(ids[1]).await.unwrap().is_none());
    assert!(outbox.get(ids[2]).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_portal_table_is_separate() {
    let test_db = TestDatabase::new().await;
    let db = test_db.db.clone().with_outbox_table(OutboxTable::Portal);
    let aggregate_id = TestDatabase::aggregate_id();

    let mut uow = db.begin().await.unwrap();
    let portal = db
        .outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("Portal", aggregate_id.clone(), "portal.updated"),
        )
        .await
        .unwrap();
    // Same key in the generic table is not a duplicate.
    let core = test_db
        .db
        .outbox
        .emit(
            &mut uow,
            NewOutboxEvent::new("Portal", aggregate_id, "portal.updated"),
        )
        .await
        .unwrap();
    uow.commit().await.unwrap();

    assert!(db.outbox.get(portal.id).await.unwrap().is_some());
    assert!(db.outbox.get(core.id).await.unwrap().is_none());
    assert!(test_db.db.outbox.get(core.id).await.unwrap().is_some());

    let counts = db.outbox.status_counts().await.unwrap();
    assert!(counts.pending >= 1);
    let recent = db
        .outbox
        .list_recent(Some(OutboxStatus::Pending), 10)
        .await
        .unwrap();
    assert!(recent.iter().all(|e| e.status == OutboxStatus::Pending));
}
