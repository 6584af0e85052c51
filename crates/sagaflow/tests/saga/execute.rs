//! Forward execution, compensation, timeouts and aborts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sagaflow::{
    AbortHandle, CheckpointStore, Error, SagaContext, SagaId, SagaState, SagaStatus, SagaStep,
    StepContext, StepError, StepOutput,
};
use serde_json::json;
use tokio::sync::Notify;

use crate::support::{
    Journal, abandoned_checkpoint, definition, failing_step, no_retries, ok_step, orchestrator, orchestrator_with,
    stubborn_step,
};

/// Steps modelled on a backtest pipeline. `run_strategy` fails `failures`
/// times before succeeding and has a budget of two retries.
fn backtest_steps(journal: &Journal, failures: u32) -> Vec<SagaStep> {
    let attempts = Arc::new(AtomicU32::new(0));

    let create_journal = journal.clone();
    let delete_journal = journal.clone();
    let create = SagaStep::from_fn("create_backtest", move |ctx: StepContext| {
        let journal = create_journal.clone();
        async move {
            journal.push("exec:create_backtest");
            let symbol: Option<String> = ctx
                .context()
                .decode("symbol")
                .map_err(StepError::execution)?;
            let mut out = StepOutput::new();
            out.insert("backtest_id".into(), json!(17));
            out.insert("symbol".into(), json!(symbol.unwrap_or_default()));
            Ok(out)
        }
    })
    .compensate_with(move |ctx: StepContext| {
        let journal = delete_journal.clone();
        async move {
            assert_eq!(ctx.context().get("backtest_id"), Some(&json!(17)));
            journal.push("comp:create_backtest");
            Ok(())
        }
    });

    let run_journal = journal.clone();
    let run = SagaStep::from_fn("run_strategy", move |ctx: StepContext| {
        let journal = run_journal.clone();
        let attempts = attempts.clone();
        async move {
            journal.push("exec:run_strategy");
            if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                return Err(StepError::execution("market data feed unavailable"));
            }
            let backtest_id = ctx.context().get("backtest_id").cloned();
            let mut out = StepOutput::new();
            out.insert("trades".into(), json!(42));
            out.insert("for_backtest".into(), backtest_id.unwrap_or_default());
            Ok(out)
        }
    })
    .max_retries(2);

    vec![create, run, ok_step("save_results", journal)]
}

#[tokio::test]
async fn success_runs_steps_in_order_and_merges_context() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, store) = orchestrator(definition(
        "pipeline",
        [
            ok_step("a", &journal),
            ok_step("b", &journal),
            ok_step("c", &journal),
        ],
    ));

    let mut initial = SagaContext::new();
    initial.insert("requested_by", "desk-3")?;
    let result = orchestrator.execute(initial).await?;

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(result.completed_steps, vec!["a", "b", "c"]);
    assert!(result.compensated_steps.is_empty());
    assert!(result.error.is_none());
    assert_eq!(journal.executed(), vec!["a", "b", "c"]);
    assert!(journal.compensated().is_empty());

    assert_eq!(result.context.get("requested_by"), Some(&json!("desk-3")));
    for key in ["a_done", "b_done", "c_done"] {
        assert_eq!(result.context.get(key), Some(&json!(true)), "{key}");
    }

    let checkpoint = store.load(&result.saga_id).await?.expect("checkpoint saved");
    assert_eq!(checkpoint.state, SagaState::Completed);
    assert_eq!(checkpoint.current_step_index, 3);
    assert_eq!(checkpoint.total_steps, 3);
    assert_eq!(checkpoint.saga_type, "pipeline");
    assert_eq!(checkpoint.context, result.context);
    Ok(())
}

#[tokio::test]
async fn failure_compensates_completed_steps_in_reverse() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, store) = orchestrator_with(
        definition(
            "pipeline",
            [
                ok_step("a", &journal),
                ok_step("b", &journal),
                failing_step("c", &journal),
                ok_step("d", &journal),
            ],
        ),
        no_retries(),
    );

    let result = orchestrator.execute(SagaContext::new()).await?;

    assert_eq!(result.status, SagaStatus::Failed);
    assert_eq!(result.completed_steps, vec!["a", "b"]);
    assert_eq!(result.compensated_steps, vec!["b", "a"]);
    let error = result.error.as_deref().unwrap_or_default();
    assert!(error.contains("c exploded"), "{error}");

    assert_eq!(
        journal.entries(),
        vec!["exec:a", "exec:b", "exec:c", "comp:b", "comp:a"]
    );

    let checkpoint = store.load(&result.saga_id).await?.expect("checkpoint saved");
    assert_eq!(checkpoint.state, SagaState::Failed);
    assert_eq!(checkpoint.error.as_deref(), Some(error));
    Ok(())
}

#[tokio::test]
async fn first_step_failure_has_nothing_to_compensate() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, _store) = orchestrator_with(
        definition(
            "pipeline",
            [failing_step("a", &journal), ok_step("b", &journal)],
        ),
        no_retries(),
    );

    let result = orchestrator.execute(SagaContext::new()).await?;

    assert_eq!(result.status, SagaStatus::Failed);
    assert!(result.completed_steps.is_empty());
    assert!(result.compensated_steps.is_empty());
    assert_eq!(journal.entries(), vec!["exec:a"]);
    Ok(())
}

#[tokio::test]
async fn backtest_recovers_from_transient_failures() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, store) = orchestrator(definition("backtest", backtest_steps(&journal, 2)));

    let mut initial = SagaContext::new();
    initial.insert("symbol", "AAPL")?;
    let result = orchestrator.execute(initial).await?;

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(
        journal.executed(),
        vec![
            "create_backtest",
            "run_strategy",
            "run_strategy",
            "run_strategy",
            "save_results"
        ]
    );
    assert_eq!(result.context.get("symbol"), Some(&json!("AAPL")));
    assert_eq!(result.context.get("for_backtest"), Some(&json!(17)));
    assert_eq!(result.context.get("trades"), Some(&json!(42)));

    let checkpoint = store.load(&result.saga_id).await?.expect("checkpoint saved");
    assert_eq!(checkpoint.retries, 2);
    Ok(())
}

#[tokio::test]
async fn backtest_exhausting_retries_deletes_backtest() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, _store) =
        orchestrator(definition("backtest", backtest_steps(&journal, u32::MAX)));

    let result = orchestrator.execute(SagaContext::new()).await?;

    assert_eq!(result.status, SagaStatus::Failed);
    assert_eq!(result.completed_steps, vec!["create_backtest"]);
    assert_eq!(result.compensated_steps, vec!["create_backtest"]);
    assert_eq!(
        journal.entries(),
        vec![
            "exec:create_backtest",
            "exec:run_strategy",
            "exec:run_strategy",
            "exec:run_strategy",
            "comp:create_backtest"
        ]
    );
    let error = result.error.unwrap_or_default();
    assert!(error.contains("run_strategy"), "{error}");
    assert!(error.contains("market data feed unavailable"), "{error}");
    Ok(())
}

#[tokio::test]
async fn compensation_failure_does_not_stop_rollback() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, _store) = orchestrator_with(
        definition(
            "pipeline",
            [
                ok_step("a", &journal),
                stubborn_step("b", &journal),
                ok_step("c", &journal),
                failing_step("d", &journal),
            ],
        ),
        no_retries(),
    );

    let result = orchestrator.execute(SagaContext::new()).await?;

    assert_eq!(result.status, SagaStatus::Failed);
    assert_eq!(journal.compensated(), vec!["c", "b", "a"]);
    assert_eq!(result.compensated_steps, vec!["c", "a"]);
    Ok(())
}

#[tokio::test]
async fn steps_without_compensation_are_skipped() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, _store) = orchestrator_with(
        definition(
            "pipeline",
            [
                ok_step("a", &journal),
                SagaStep::from_fn("notify", |_ctx| async { Ok(StepOutput::new()) }),
                failing_step("c", &journal),
            ],
        ),
        no_retries(),
    );

    let result = orchestrator.execute(SagaContext::new()).await?;

    assert_eq!(result.completed_steps, vec!["a", "notify"]);
    assert_eq!(result.compensated_steps, vec!["a"]);
    Ok(())
}

#[tokio::test]
async fn step_timeout_fails_attempt_and_cancels_it() -> anyhow::Result<()> {
    let journal = Journal::new();
    let cancelled = Arc::new(Notify::new());

    let observed = cancelled.clone();
    let slow = SagaStep::from_fn("slow", move |ctx: StepContext| {
        let observed = observed.clone();
        async move {
            let token = ctx.cancellation.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                observed.notify_one();
            });
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StepOutput::new())
        }
    })
    .timeout(Duration::from_millis(50))
    .max_retries(0);

    let (orchestrator, _store) = orchestrator(definition(
        "pipeline",
        [ok_step("a", &journal), slow, ok_step("c", &journal)],
    ));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.execute(SagaContext::new()),
    )
    .await??;

    assert_eq!(result.status, SagaStatus::Failed);
    assert_eq!(result.compensated_steps, vec!["a"]);
    let error = result.error.unwrap_or_default();
    assert!(error.contains("timed out after 50ms"), "{error}");

    tokio::time::timeout(Duration::from_secs(5), cancelled.notified()).await?;
    Ok(())
}

#[tokio::test]
async fn abort_rolls_back_before_next_step() -> anyhow::Result<()> {
    let journal = Journal::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let gate_journal = journal.clone();
    let gate_entered = entered.clone();
    let gate_release = release.clone();
    let gate = SagaStep::from_fn("gate", move |_ctx| {
        let journal = gate_journal.clone();
        let entered = gate_entered.clone();
        let release = gate_release.clone();
        async move {
            journal.push("exec:gate");
            entered.notify_one();
            release.notified().await;
            Ok(StepOutput::new())
        }
    })
    .compensate_with({
        let journal = journal.clone();
        move |_ctx| {
            let journal = journal.clone();
            async move {
                journal.push("comp:gate");
                Ok(())
            }
        }
    });

    let (orchestrator, store) = orchestrator(definition(
        "pipeline",
        [ok_step("a", &journal), gate, ok_step("c", &journal)],
    ));

    let handle = orchestrator.spawn(SagaContext::new());
    entered.notified().await;
    handle.abort();
    release.notify_one();

    let saga_id = handle.saga_id().clone();
    let result = handle.join().await?;

    assert_eq!(result.status, SagaStatus::Aborted);
    assert_eq!(result.saga_id, saga_id);
    assert_eq!(result.completed_steps, vec!["a", "gate"]);
    assert_eq!(result.compensated_steps, vec!["gate", "a"]);
    assert_eq!(journal.executed(), vec!["a", "gate"]);

    let checkpoint = store.load(&saga_id).await?.expect("checkpoint saved");
    assert_eq!(checkpoint.state, SagaState::Aborted);
    Ok(())
}

#[tokio::test]
async fn abort_before_start_runs_nothing() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, _store) = orchestrator(definition(
        "pipeline",
        [ok_step("a", &journal), ok_step("b", &journal)],
    ));

    let abort = AbortHandle::new();
    abort.abort();
    let result = orchestrator
        .execute_with(SagaId::new("aborted-early"), SagaContext::new(), &abort)
        .await?;

    assert_eq!(result.status, SagaStatus::Aborted);
    assert!(result.completed_steps.is_empty());
    assert!(journal.entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn taken_saga_id_is_rejected() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, store) = orchestrator(definition(
        "pipeline",
        [ok_step("a", &journal), ok_step("b", &journal)],
    ));
    let in_flight = abandoned_checkpoint("order-7", "pipeline", 2, &["a"], Duration::ZERO);
    store.save(&in_flight).await?;

    let err = orchestrator
        .execute_with(SagaId::new("order-7"), SagaContext::new(), &AbortHandle::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SagaExists(ref id) if id.as_str() == "order-7"), "{err}");
    assert_eq!(store.load(&in_flight.saga_id).await?, Some(in_flight));
    assert_eq!(store.audit_count(), 0);
    assert!(journal.entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_sagas_do_not_share_state() -> anyhow::Result<()> {
    let journal = Journal::new();
    let echo = SagaStep::from_fn("echo", |ctx: StepContext| async move {
        let mut out = StepOutput::new();
        out.insert("echo".into(), ctx.context().get("n").cloned().unwrap_or_default());
        out.insert("saga".into(), json!(ctx.saga_id.as_str()));
        Ok(out)
    });
    let (orchestrator, store) = orchestrator(definition(
        "pipeline",
        [ok_step("a", &journal), echo, ok_step("c", &journal)],
    ));

    let mut handles = Vec::new();
    for n in 0..20usize {
        let mut initial = SagaContext::new();
        initial.insert("n", n)?;
        handles.push(orchestrator.spawn(initial));
    }

    for (n, handle) in handles.into_iter().enumerate() {
        let result = handle.join().await?;
        assert!(result.is_completed());
        assert_eq!(result.context.get("n"), Some(&json!(n)));
        assert_eq!(result.context.get("echo"), Some(&json!(n)));
        assert_eq!(
            result.context.get("saga"),
            Some(&json!(result.saga_id.as_str()))
        );
    }

    assert_eq!(store.checkpoint_count(), 20);
    assert_eq!(journal.executed().len(), 40);
    Ok(())
}

#[tokio::test]
async fn terminal_checkpoint_cannot_be_overwritten() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, store) = orchestrator(definition("pipeline", [ok_step("a", &journal)]));

    let result = orchestrator.execute(SagaContext::new()).await?;
    let mut checkpoint = store.load(&result.saga_id).await?.expect("checkpoint saved");
    checkpoint.error = Some("rewritten".into());

    let err = store.save(&checkpoint).await.unwrap_err();
    assert!(matches!(err, Error::CheckpointImmutable(id) if id == result.saga_id));

    let stored = store.load(&result.saga_id).await?.expect("checkpoint saved");
    assert!(stored.error.is_none());
    Ok(())
}

#[tokio::test]
async fn checkpoint_timestamps_never_go_backwards() -> anyhow::Result<()> {
    let journal = Journal::new();
    let (orchestrator, store) = orchestrator_with(
        definition(
            "pipeline",
            [
                ok_step("a", &journal),
                ok_step("b", &journal),
                failing_step("c", &journal),
            ],
        ),
        no_retries(),
    );

    let result = orchestrator.execute(SagaContext::new()).await?;
    let checkpoint = store.load(&result.saga_id).await?.expect("checkpoint saved");
    assert!(checkpoint.updated_at >= checkpoint.started_at);

    let trail = crate::support::audit_trail(&store, &result.saga_id).await;
    assert!(
        trail
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    );
    assert!(trail.iter().all(|e| e.timestamp >= checkpoint.started_at));
    Ok(())
}
