use crate::catalog::Catalog;
use crate::error::HarnessError;
use crate::provider::Provider;
use crate::scenario::{Scenario, ScenarioDriver, ScenarioOutcome, SkipReason, Suite};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Expands suites and catalog into the list of scenarios to run.
///
/// `providers` restricts the peer providers; empty means all of them.
pub fn enumerate(catalog: &Catalog, suites: &[Suite], providers: &[Provider]) -> Vec<Scenario> {
    let mut scenarios = Vec::new();
    for &suite in suites {
        for &peer in suite.peers() {
            if !providers.is_empty() && !providers.contains(&peer) {
                continue;
            }
            for cipher in &catalog.ciphers {
                for &curve in &catalog.curves {
                    for &protocol in &catalog.protocols {
                        for certificate in &catalog.certificates {
                            scenarios.push(Scenario {
                                suite,
                                peer,
                                cipher: cipher.clone(),
                                curve,
                                protocol,
                                certificate: certificate.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
    scenarios
}

/// A scenario that did not pass
#[derive(Debug, Clone)]
pub struct Failure {
    pub id: String,
    pub error: String,
}

/// Aggregate outcome of a matrix run
#[derive(Debug, Clone)]
pub struct MatrixSummary {
    pub started_at: DateTime<Local>,
    pub passed: usize,
    pub failed: usize,
    /// Skipped for a known provider limitation
    pub skipped: usize,
    /// Pruned by the applicability filter
    pub pruned: usize,
    /// Never finished because the run was stopped
    pub aborted: usize,
    pub failures: Vec<Failure>,
}

impl MatrixSummary {
    fn new() -> Self {
        Self {
            started_at: Local::now(),
            passed: 0,
            failed: 0,
            skipped: 0,
            pruned: 0,
            aborted: 0,
            failures: Vec::new(),
        }
    }

    /// True when nothing failed and nothing was cut short
    pub fn success(&self) -> bool {
        self.failed == 0 && self.aborted == 0
    }

    fn record(&mut self, id: String, outcome: eyre::Result<ScenarioOutcome>) {
        match outcome {
            Ok(ScenarioOutcome::Passed) => self.passed += 1,
            Ok(ScenarioOutcome::Skipped(SkipReason::InvalidParameters)) => self.pruned += 1,
            Ok(ScenarioOutcome::Skipped(SkipReason::KnownLimitation(reason))) => {
                info!("{} skipped: {}", id, reason);
                self.skipped += 1;
            }
            Err(e) => {
                error!("{} failed: {:#}", id, e);
                self.failed += 1;
                self.failures.push(Failure {
                    id,
                    error: format!("{:#}", e),
                });
            }
        }
    }
}

/// Options for [`run_matrix`]
#[derive(Debug, Clone, Copy)]
pub struct MatrixOptions {
    /// Scenarios in flight at once
    pub jobs: usize,
    /// Stop launching and abort running scenarios on the first failure
    pub fail_fast: bool,
}

/// Runs every scenario with bounded concurrency.
///
/// Cancelling `cancel` (Ctrl-C) aborts running scenarios; their processes
/// are killed when the aborted tasks drop them.
pub async fn run_matrix(
    driver: Arc<ScenarioDriver>,
    scenarios: Vec<Scenario>,
    options: MatrixOptions,
    cancel: CancellationToken,
) -> MatrixSummary {
    let mut summary = MatrixSummary::new();
    let total = scenarios.len();
    let jobs = options.jobs.max(1);
    let run_started = Instant::now();
    info!("Running {} scenarios, {} at a time", total, jobs);

    let mut pending = scenarios.into_iter();
    let mut running = JoinSet::new();
    let mut stopping = false;

    loop {
        while !stopping && running.len() < jobs {
            let Some(scenario) = pending.next() else { break };
            let driver = driver.clone();
            let id = scenario.id();
            let span = info_span!("scenario", id = %id);
            running.spawn(
                async move {
                    let mut outcome = driver.run(&scenario).await;
                    if let Err(e) = &outcome {
                        if e.downcast_ref::<HarnessError>().is_some_and(HarnessError::is_transient) {
                            warn!("{:#}, retrying once in {:?}", e, TRANSIENT_RETRY_DELAY);
                            sleep(TRANSIENT_RETRY_DELAY).await;
                            outcome = driver.run(&scenario).await;
                        }
                    }
                    (id, outcome)
                }
                .instrument(span),
            );
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled(), if !stopping => {
                warn!("Run cancelled, aborting {} running scenarios", running.len());
                stopping = true;
                running.abort_all();
            }
            joined = running.join_next() => match joined {
                None => break,
                Some(Ok((id, outcome))) => {
                    let failed = outcome.is_err();
                    summary.record(id, outcome);
                    if failed && options.fail_fast && !stopping {
                        warn!("Failing fast, aborting {} running scenarios", running.len());
                        stopping = true;
                        running.abort_all();
                    }
                }
                Some(Err(e)) if e.is_cancelled() => summary.aborted += 1,
                Some(Err(e)) => {
                    error!("Scenario task panicked: {}", e);
                    summary.failed += 1;
                    summary.failures.push(Failure {
                        id: "<panicked>".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
    summary.aborted += pending.len();

    info!(
        "Matrix started {} finished in {:.1?}: {} passed, {} failed, {} skipped, {} pruned, {} aborted",
        summary.started_at.format("%Y-%m-%d %H:%M:%S"),
        run_started.elapsed(),
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.pruned,
        summary.aborted
    );
    summary
}
