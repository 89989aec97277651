//! Background Task Set
//!
//! The fixed set of independent periodic tasks driving one replica: log
//! pull, queue execution workers, merge selection, mutation scheduling and
//! finalization, cleanup, part existence checking, leadership refresh, and
//! the session-recovery watcher. Every task observes the shutdown flag at
//! its suspension points; in-flight work runs to its next safe checkpoint
//! rather than aborting mid-write.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;

use super::{EngineState, ReplicatedTable};
use crate::merge::SelectOutcome;

/// Spawn the full background task set for an initialized replica
pub async fn spawn_all(table: &Arc<ReplicatedTable>) {
    let config = table.config();
    let pull_interval = config.pull_interval();
    let select_interval = config.select_interval();
    let cleanup_interval = config.cleanup_interval();
    let workers = config.queue.workers;

    spawn_periodic(table, "log_pull", pull_interval, |table| async move {
        if let Err(e) = table.pull_log().await {
            table.note_error(&e);
            tracing::debug!(error = %e, "log pull failed");
        }
    })
    .await;

    for worker in 0..workers {
        spawn_queue_worker(table, worker).await;
    }

    spawn_periodic(table, "merge_select", select_interval, |table| async move {
        match table.select_merge_once().await {
            Ok(SelectOutcome::MissingPart(part)) => {
                tracing::debug!(part = %part, "merge candidate vanished, will retry");
            }
            Ok(SelectOutcome::LogUpdated) => {
                tracing::debug!("log moved during merge selection, will retry");
            }
            Ok(_) => {}
            Err(e) => {
                table.note_error(&e);
                tracing::debug!(error = %e, "merge selection failed");
            }
        }
    })
    .await;

    spawn_periodic(table, "mutation_schedule", select_interval, |table| async move {
        if let Err(e) = table.select_mutation_once().await {
            table.note_error(&e);
            tracing::debug!(error = %e, "mutation scheduling failed");
        }
    })
    .await;

    spawn_periodic(table, "mutation_finalize", select_interval, |table| async move {
        if let Err(e) = table.finalize_mutations_once().await {
            table.note_error(&e);
            tracing::debug!(error = %e, "mutation finalization failed");
        }
    })
    .await;

    spawn_periodic(table, "cleanup", cleanup_interval, |table| async move {
        if let Err(e) = table.run_cleanup_once().await {
            table.note_error(&e);
            tracing::debug!(error = %e, "cleanup failed");
        }
    })
    .await;

    spawn_periodic(table, "part_check", cleanup_interval, |table| async move {
        if let Err(e) = table.run_part_check_once().await {
            table.note_error(&e);
            tracing::debug!(error = %e, "part check failed");
        }
    })
    .await;

    spawn_periodic(table, "leadership", pull_interval, |table| async move {
        // Session loss surfaces here as an error and is handled by the
        // recovery watcher; everything else is a plain refresh
        if let Err(e) = table.refresh_leadership().await {
            if !e.triggers_reinit() {
                table.note_error(&e);
            }
        }
    })
    .await;

    spawn_recovery_watcher(table).await;
}

/// A periodic task running `body` while the engine is Active
async fn spawn_periodic<F, Fut>(
    table: &Arc<ReplicatedTable>,
    name: &'static str,
    period: Duration,
    body: F,
) where
    F: Fn(Arc<ReplicatedTable>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let table_ref = Arc::clone(table);
    let handle = tokio::spawn(async move {
        let mut shutdown = table_ref.shutdown_watch();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if table_ref.state() == EngineState::Active {
                        body(Arc::clone(&table_ref)).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!(task = name, "background task stopping");
                        return;
                    }
                }
            }
        }
    });
    table.push_task_handle(handle).await;
}

/// One queue execution worker of the bounded pool
async fn spawn_queue_worker(table: &Arc<ReplicatedTable>, worker: usize) {
    let table_ref = Arc::clone(table);
    let handle = tokio::spawn(async move {
        let mut shutdown = table_ref.shutdown_watch();
        loop {
            if *shutdown.borrow() {
                tracing::debug!(worker, "queue worker stopping");
                return;
            }
            if table_ref.state() != EngineState::Active {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            match table_ref.execute_queue_step().await {
                Ok(true) => {}
                Ok(false) => {
                    // Nothing ready; idle briefly without blocking shutdown
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    // Session loss: back off and let the recovery watcher
                    // rebuild state
                    tracing::debug!(worker, error = %e, "queue worker pausing");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });
    table.push_task_handle(handle).await;
}

/// Watches for session expiry and drives reinitialization
async fn spawn_recovery_watcher(table: &Arc<ReplicatedTable>) {
    let table_ref = Arc::clone(table);
    let handle = tokio::spawn(async move {
        let mut shutdown = table_ref.shutdown_watch();
        loop {
            if *shutdown.borrow() {
                return;
            }
            let mut expired = table_ref.session_expired_watch().await;
            let lost = tokio::select! {
                changed = expired.changed() => {
                    // A dropped sender also means the session is gone
                    changed.is_err() || *expired.borrow()
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    false
                }
            };
            if lost {
                if let Err(e) = table_ref.reinitialize().await {
                    tracing::debug!(error = %e, "recovery aborted");
                    return;
                }
            }
        }
    });
    table.push_task_handle(handle).await;
}
