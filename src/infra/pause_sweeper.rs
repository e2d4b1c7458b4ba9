use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::{
    app_error::AppResult,
    application::{
        scope::TenantScope,
        use_cases::subscription_pause::{PauseStateMachine, SweepReport},
    },
};

/// Totals over every scope visited by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepTotals {
    pub scopes: usize,
    pub activated: usize,
    pub resumed: usize,
    pub failed: usize,
}

pub async fn run_pause_sweep_loop(
    pauses: Arc<PauseStateMachine>,
    every: Duration,
    storage_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Pause sweep worker started (sweeping every {}s)",
        every.as_secs()
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&pauses, storage_timeout).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Pause sweep worker stopping");
                    return;
                }
            }
        }
    }
}

/// Activates then resumes due pauses in every scope that has any.
/// A failing scope is logged and skipped; the others still run.
pub async fn sweep_once(pauses: &PauseStateMachine, storage_timeout: Duration) -> SweepTotals {
    let now = pauses.now();
    let scopes = match pauses.due_scopes(now).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to list scopes with due pauses");
            return SweepTotals::default();
        }
    };

    let mut totals = SweepTotals::default();
    for scope in scopes {
        totals.scopes += 1;
        let scope = scope.with_actor("pause_sweeper");

        // Each pass gets its own deadline.
        let activated = pauses
            .activate_due_pauses(&scope.clone().with_timeout(storage_timeout), now)
            .await;
        tally(&scope, "activate", activated, &mut totals.activated, &mut totals.failed);

        let resumed = pauses
            .resume_due_pauses(&scope.clone().with_timeout(storage_timeout), now)
            .await;
        tally(&scope, "resume", resumed, &mut totals.resumed, &mut totals.failed);
    }

    if totals.activated + totals.resumed + totals.failed > 0 {
        info!(
            scopes = totals.scopes,
            activated = totals.activated,
            resumed = totals.resumed,
            failed = totals.failed,
            "Pause sweep finished"
        );
    }
    totals
}

fn tally(
    scope: &TenantScope,
    pass: &str,
    result: AppResult<SweepReport>,
    done: &mut usize,
    failed: &mut usize,
) {
    match result {
        Ok(report) => {
            *done += report.transitioned;
            for (pause_id, err) in &report.failures {
                warn!(
                    tenant_id = %scope.tenant_id(),
                    environment_id = %scope.environment_id(),
                    %pause_id,
                    pass,
                    error = %err,
                    "Pause transition failed"
                );
            }
            *failed += report.failures.len();
        }
        Err(e) => {
            error!(
                tenant_id = %scope.tenant_id(),
                environment_id = %scope.environment_id(),
                pass,
                error = %e,
                "Pause sweep failed for scope"
            );
            *failed += 1;
        }
    }
}
