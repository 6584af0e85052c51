//! Integration tests for PgStore.

use std::time::Duration;

use sagaflow::{
    AuditEventType, AuditQuery, AuditStore, CheckpointStore, Error, SagaAuditLogEntry,
    SagaContext, SagaId, SagaState,
};
use serde_json::json;
use test_utils::db_test;

use crate::support::{
    fetch_context, fetch_state, insert_legacy_checkpoint, now_micros, running_checkpoint, store,
};

db_test!(save_and_load_round_trip, |pool| {
    let store = store(pool);

    let mut checkpoint =
        running_checkpoint("s-1", "backtest", 3, &["create_backtest"], now_micros());
    checkpoint.context.insert("backtest_id", 17)?;
    checkpoint.context.insert("symbol", "AAPL")?;
    checkpoint.retries = 2;
    store.save(&checkpoint).await?;

    let loaded = store.load(&checkpoint.saga_id).await?;
    assert_eq!(loaded, Some(checkpoint));
    Ok(())
});

db_test!(load_unknown_saga_returns_none, |pool| {
    let store = store(pool);

    assert!(store.load(&SagaId::new("missing")).await?.is_none());
    Ok(())
});

db_test!(create_refuses_existing_saga_id, |pool| {
    let store = store(pool);

    let first = running_checkpoint("s-1", "backtest", 3, &["create_backtest"], now_micros());
    store.create(&first).await?;

    let second = running_checkpoint("s-1", "backtest", 3, &[], now_micros());
    let err = store.create(&second).await.unwrap_err();
    assert!(matches!(err, Error::SagaExists(ref id) if id.as_str() == "s-1"), "{err}");

    let loaded = store.load(&first.saga_id).await?;
    assert_eq!(loaded, Some(first));
    Ok(())
});

db_test!(save_overwrites_non_terminal_row, |pool| {
    let store = store(pool);

    let mut checkpoint = running_checkpoint("s-1", "backtest", 3, &[], now_micros());
    store.save(&checkpoint).await?;

    checkpoint.record_completed("create_backtest");
    checkpoint.record_completed("run_strategy");
    checkpoint.updated_at = now_micros();
    store.save(&checkpoint).await?;

    let loaded = store.load(&checkpoint.saga_id).await?.expect("row exists");
    assert_eq!(loaded.completed_steps, vec!["create_backtest", "run_strategy"]);
    assert_eq!(loaded.current_step_index, 2);
    assert_eq!(loaded.started_at, checkpoint.started_at);
    Ok(())
});

db_test!(terminal_row_is_immutable, |pool| {
    let store = store(pool);

    let mut checkpoint = running_checkpoint("s-1", "backtest", 1, &["only"], now_micros());
    checkpoint.transition(SagaState::Completed)?;
    store.save(&checkpoint).await?;

    checkpoint.error = Some("rewritten".into());
    let err = store.save(&checkpoint).await.unwrap_err();
    assert!(matches!(err, Error::CheckpointImmutable(_)), "{err}");

    let loaded = store.load(&checkpoint.saga_id).await?.expect("row exists");
    assert_eq!(loaded.state, SagaState::Completed);
    assert!(loaded.error.is_none());
    Ok(())
});

db_test!(states_are_stored_lowercase, |pool| {
    let store = store(pool);

    let mut checkpoint = running_checkpoint("s-1", "backtest", 1, &[], now_micros());
    checkpoint.transition(SagaState::Compensating)?;
    store.save(&checkpoint).await?;

    assert_eq!(fetch_state(pool, "s-1").await?, "compensating");
    Ok(())
});

db_test!(context_is_stored_in_versioned_envelope, |pool| {
    let store = store(pool);

    let mut checkpoint = running_checkpoint("s-1", "backtest", 1, &[], now_micros());
    checkpoint.context.insert("symbol", "AAPL")?;
    store.save(&checkpoint).await?;

    let raw = fetch_context(pool, "s-1").await?;
    assert_eq!(
        raw,
        json!({
            "schema_version": 1,
            "saga_type": "backtest",
            "values": { "symbol": "AAPL" }
        })
    );
    Ok(())
});

db_test!(legacy_bare_context_still_loads, |pool| {
    let store = store(pool);

    insert_legacy_checkpoint(pool, "old-1", json!({ "symbol": "MSFT" })).await?;

    let loaded = store
        .load(&SagaId::new("old-1"))
        .await?
        .expect("row exists");
    assert_eq!(loaded.saga_type, "");
    assert_eq!(loaded.context.schema_version(), 0);
    assert_eq!(loaded.context.get("symbol"), Some(&json!("MSFT")));
    assert_eq!(loaded.state, SagaState::Running);
    Ok(())
});

db_test!(query_stale_filters_orders_and_limits, |pool| {
    let store = store(pool);
    let now = now_micros();

    for (id, age_secs) in [("old", 3_000), ("older", 4_000), ("oldest", 5_000), ("fresh", 1)] {
        let checkpoint = running_checkpoint(
            id,
            "backtest",
            2,
            &[],
            now - Duration::from_secs(age_secs),
        );
        store.save(&checkpoint).await?;
    }
    let mut compensating = running_checkpoint(
        "unwinding",
        "backtest",
        2,
        &[],
        now - Duration::from_secs(6_000),
    );
    compensating.transition(SagaState::Compensating)?;
    store.save(&compensating).await?;

    let cutoff = now - Duration::from_secs(60);
    let stale = store.query_stale(SagaState::Running, cutoff, 10).await?;
    let ids: Vec<_> = stale.iter().map(|c| c.saga_id.as_str()).collect();
    assert_eq!(ids, vec!["oldest", "older", "old"]);

    let limited = store.query_stale(SagaState::Running, cutoff, 2).await?;
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].saga_id.as_str(), "oldest");

    let unwinding = store
        .query_stale(SagaState::Compensating, cutoff, 10)
        .await?;
    assert_eq!(unwinding.len(), 1);
    assert_eq!(unwinding[0].saga_id.as_str(), "unwinding");
    Ok(())
});

db_test!(audit_entries_append_and_filter, |pool| {
    let store = store(pool);
    let now = now_micros();

    for id in ["s-1", "s-2"] {
        store
            .save(&running_checkpoint(id, "backtest", 2, &[], now))
            .await?;
    }

    let entries = [
        SagaAuditLogEntry::new(
            SagaId::new("s-1"),
            AuditEventType::SagaStart,
            SagaContext::new(),
            now,
        )
        .states(SagaState::Idle, SagaState::Running)
        .data("total_steps", 2),
        SagaAuditLogEntry::new(
            SagaId::new("s-1"),
            AuditEventType::StepFailed,
            SagaContext::new(),
            now + Duration::from_millis(5),
        )
        .step("run_strategy", 1)
        .error_message("market data feed unavailable")
        .retry_count(2),
        SagaAuditLogEntry::new(
            SagaId::new("s-2"),
            AuditEventType::SagaStart,
            SagaContext::new(),
            now + Duration::from_millis(10),
        ),
    ];

    let mut ids = Vec::new();
    for mut entry in entries {
        if entry.saga_id.as_str() == "s-1" {
            entry.user_id = Some("analyst-7".into());
        }
        ids.push(store.append(&entry).await?);
    }
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    let trail = store
        .query(&AuditQuery::new().saga_id(SagaId::new("s-1")))
        .await?;
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].id, Some(ids[0]));
    assert_eq!(trail[0].saga_state_after, Some(SagaState::Running));
    assert_eq!(trail[0].event_data.get("total_steps"), Some(&json!(2)));
    assert_eq!(trail[1].event_type, AuditEventType::StepFailed);
    assert_eq!(trail[1].step_name.as_deref(), Some("run_strategy"));
    assert_eq!(trail[1].step_index, Some(1));
    assert_eq!(trail[1].retry_count, 2);

    let starts = store
        .query(&AuditQuery::new().event_type(AuditEventType::SagaStart))
        .await?;
    assert_eq!(starts.len(), 2);

    let by_user = store
        .query(&AuditQuery::new().user_id("analyst-7").limit(1))
        .await?;
    assert_eq!(by_user.len(), 1);
    assert_eq!(by_user[0].event_type, AuditEventType::SagaStart);

    // `to` is exclusive.
    let window = store
        .query(&AuditQuery::new().between(now, now + Duration::from_millis(10)))
        .await?;
    assert_eq!(window.len(), 2);
    Ok(())
});
