use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::bundle::{build_handover_bundle_with, BundleOptions};
use crate::clock::Clock;
use crate::model::HandoverRecord;
use crate::net::{NetError, NetworkClient, OperationIssue, PostResponse, TokenProvider, ValidatedUrl};
use crate::queue::{EnqueueOutcome, QueueError, QueueItem, QueueStore, SyncStatus};

/// Backoff schedule in minutes, indexed by completed failed attempts minus
/// one and capped at the last step.
const BACKOFF_SCHEDULE_MIN: [u64; 4] = [1, 5, 15, 60];

/// Delay before the next attempt after `failures` prior failures
/// (0-indexed: the first failure waits `backoff_delay_ms(0)`).
pub fn backoff_delay_ms(failures: u32) -> u64 {
    let idx = (failures as usize).min(BACKOFF_SCHEDULE_MIN.len() - 1);
    BACKOFF_SCHEDULE_MIN[idx] * 60_000
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("bundle serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("token acquisition failed: {0}")]
    Token(NetError),

    #[error("network configuration error: {0}")]
    Config(NetError),
}

/// Tagged outcome of one dispatch attempt. The drain loop branches on this
/// instead of catching errors across await points.
#[derive(Debug, Clone, PartialEq)]
enum Disposition {
    Sent,
    /// 409: the server already holds a resource matching the conditional
    /// create from a prior attempt. Treated exactly like success.
    AlreadyApplied,
    Retryable { reason: String },
    Fatal { status: u16, issues: Vec<OperationIssue>, error: Option<String> },
}

fn classify(result: Result<PostResponse, NetError>) -> Disposition {
    match result {
        Ok(response) if response.ok => Disposition::Sent,
        Ok(response) if response.status == 409 => Disposition::AlreadyApplied,
        Ok(response)
            if response.status == 408
                || response.status == 429
                || response.status >= 500 =>
        {
            Disposition::Retryable {
                reason: response
                    .first_diagnostic()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("HTTP {}", response.status)),
            }
        }
        Ok(response) => {
            let error = response.first_diagnostic().map(str::to_string);
            Disposition::Fatal {
                status: response.status,
                issues: response.issues,
                error,
            }
        }
        Err(e) => Disposition::Retryable {
            reason: e.to_string(),
        },
    }
}

/// Summary of one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub dispatched: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// A drain was already in progress; this call did nothing.
    pub coalesced: bool,
}

pub type SentCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Orchestrates draining the queue: dispatch, outcome interpretation,
/// backoff, dead-lettering, completion callbacks. The engine never schedules
/// its own wakeups; hosts call `drain` on connectivity changes, timers or
/// user request, and concurrent calls coalesce into the pass already running.
pub struct SyncEngine {
    queue: Arc<QueueStore>,
    network: Arc<dyn NetworkClient>,
    tokens: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    endpoint: ValidatedUrl,
    bundle_options: BundleOptions,
    on_sent: Option<SentCallback>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<QueueStore>,
        network: Arc<dyn NetworkClient>,
        tokens: Arc<dyn TokenProvider>,
        clock: Arc<dyn Clock>,
        endpoint: ValidatedUrl,
    ) -> Self {
        Self {
            queue,
            network,
            tokens,
            clock,
            endpoint,
            bundle_options: BundleOptions::default(),
            on_sent: None,
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_bundle_options(mut self, options: BundleOptions) -> Self {
        self.bundle_options = options;
        self
    }

    /// Callback invoked exactly once per successfully-or-conflict-resolved
    /// item with the patient id, used by collaborators to clear local drafts.
    pub fn with_on_sent(mut self, callback: SentCallback) -> Self {
        self.on_sent = Some(callback);
        self
    }

    /// Build the transaction bundle for a handover record and enqueue it.
    #[instrument(skip(self, record), fields(patient_id = %record.patient_id))]
    pub async fn enqueue_handover(
        &self,
        record: &HandoverRecord,
    ) -> Result<EnqueueOutcome, SyncError> {
        let now = self.clock.now();
        let bundle = build_handover_bundle_with(record, now, self.bundle_options);
        let full_urls = bundle.full_urls();
        let payload = bundle.to_json()?;

        let outcome = self
            .queue
            .enqueue(&record.patient_id, payload, full_urls)
            .await?;
        debug!(?outcome, "handover enqueued");
        Ok(outcome)
    }

    /// Drain every ready item once. A failure on one item never aborts the
    /// rest of the pass; only configuration-level errors (token acquisition,
    /// insecure endpoint, storage loss) propagate.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("drain already in progress, coalescing");
            return Ok(DrainReport {
                coalesced: true,
                ..DrainReport::default()
            });
        };

        let mut token = self.tokens.bearer_token().await.map_err(SyncError::Token)?;
        let mut token_refreshed = false;

        let mut report = DrainReport::default();
        let ready = self.queue.read_ready(self.clock.now()).await;
        if ready.is_empty() {
            return Ok(report);
        }
        info!(count = ready.len(), "draining ready items");

        for snapshot in ready {
            // Re-read: the item may have been merged, replaced or removed
            // since the pass snapshot.
            let now = self.clock.now();
            let Some(mut current) = self.queue.get(&snapshot.id).await else {
                continue;
            };
            if current.sync_status == SyncStatus::Synced || current.next_attempt_at > now {
                continue;
            }

            current.sync_status = SyncStatus::InFlight;
            current.attempts = current.attempts.saturating_add(1);
            current.last_attempt_at = Some(now);
            self.queue.update(current.clone()).await?;
            report.dispatched += 1;

            let mut result = self
                .network
                .post_bundle(&self.endpoint, &current.payload, &token)
                .await;

            // An expired token surfaces as 401; re-acquire once per pass and
            // give the item a second immediate try.
            if matches!(&result, Ok(r) if r.status == 401) && !token_refreshed {
                token = self.tokens.bearer_token().await.map_err(SyncError::Token)?;
                token_refreshed = true;
                result = self
                    .network
                    .post_bundle(&self.endpoint, &current.payload, &token)
                    .await;
            }

            let disposition = match result {
                Err(e @ NetError::InsecureTransport { .. }) => return Err(SyncError::Config(e)),
                other => classify(other),
            };
            self.apply_outcome(&current, disposition, &mut report).await?;
        }

        info!(
            dispatched = report.dispatched,
            sent = report.sent,
            rescheduled = report.rescheduled,
            dead_lettered = report.dead_lettered,
            "drain pass complete"
        );
        Ok(report)
    }

    async fn apply_outcome(
        &self,
        dispatched: &QueueItem,
        disposition: Disposition,
        report: &mut DrainReport,
    ) -> Result<(), SyncError> {
        let now = self.clock.now();

        // The stored item is re-read by the dispatched id. A merge during the
        // flight changes the id, so a stale success cannot delete the newer
        // payload and a stale failure cannot reschedule it.
        let stored = self.queue.get(&dispatched.id).await;

        match disposition {
            Disposition::Sent | Disposition::AlreadyApplied => {
                if stored.is_some() {
                    self.queue.remove(&dispatched.id).await?;
                    report.sent += 1;
                    if let Some(callback) = &self.on_sent {
                        callback(&dispatched.patient_id);
                    }
                } else {
                    debug!(id = %dispatched.id, "item replaced mid-flight, newer payload stays queued");
                }
            }
            Disposition::Fatal { status, issues, error } => {
                if let Some(mut item) = stored {
                    item.sync_status = SyncStatus::Error;
                    item.error_message = Some(
                        error
                            .clone()
                            .unwrap_or_else(|| format!("HTTP {status}")),
                    );
                    warn!(id = %item.id, status, "permanent failure, dead-lettering");
                    self.queue
                        .move_to_dead_letter(item, Some(status), issues, error)
                        .await?;
                    report.dead_lettered += 1;
                }
            }
            Disposition::Retryable { reason } => {
                if let Some(mut item) = stored {
                    let delay = backoff_delay_ms(item.attempts.saturating_sub(1));
                    item.sync_status = SyncStatus::Pending;
                    item.error_message = None;
                    item.next_attempt_at = now.saturating_add_ms(delay);
                    debug!(id = %item.id, attempts = item.attempts, delay_ms = delay, %reason, "transient failure, rescheduled");
                    self.queue.update(item).await?;
                    report.rescheduled += 1;
                }
            }
        }
        Ok(())
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.depth().await
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.queue.dead_letter_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_values() {
        assert_eq!(backoff_delay_ms(0), 60_000);
        assert_eq!(backoff_delay_ms(1), 5 * 60_000);
        assert_eq!(backoff_delay_ms(2), 15 * 60_000);
        assert_eq!(backoff_delay_ms(3), 60 * 60_000);
        assert_eq!(backoff_delay_ms(4), 60 * 60_000);
        assert_eq!(backoff_delay_ms(100), 60 * 60_000);
    }

    #[test]
    fn backoff_is_monotone() {
        let mut previous = 0;
        for failures in 0..10 {
            let delay = backoff_delay_ms(failures);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn classification() {
        let ok = |status: u16| {
            classify(Ok(PostResponse {
                ok: (200..300).contains(&status),
                status,
                issues: vec![],
            }))
        };

        assert_eq!(ok(200), Disposition::Sent);
        assert_eq!(ok(201), Disposition::Sent);
        assert_eq!(ok(409), Disposition::AlreadyApplied);
        assert!(matches!(ok(500), Disposition::Retryable { .. }));
        assert!(matches!(ok(503), Disposition::Retryable { .. }));
        assert!(matches!(ok(408), Disposition::Retryable { .. }));
        assert!(matches!(ok(429), Disposition::Retryable { .. }));
        assert!(matches!(ok(400), Disposition::Fatal { status: 400, .. }));
        assert!(matches!(ok(404), Disposition::Fatal { status: 404, .. }));
        assert!(matches!(ok(422), Disposition::Fatal { status: 422, .. }));
    }

    #[test]
    fn network_errors_are_retryable() {
        let disposition = classify(Err(NetError::Timeout { timeout_ms: 1000 }));
        assert!(matches!(disposition, Disposition::Retryable { .. }));

        let disposition = classify(Err(NetError::Transport("connection refused".into())));
        assert!(matches!(disposition, Disposition::Retryable { .. }));
    }

    #[test]
    fn fatal_keeps_first_diagnostic() {
        let disposition = classify(Ok(PostResponse {
            ok: false,
            status: 422,
            issues: vec![OperationIssue {
                severity: Some("error".into()),
                code: Some("processing".into()),
                diagnostics: Some("unresolvable reference".into()),
            }],
        }));
        match disposition {
            Disposition::Fatal { status, error, .. } => {
                assert_eq!(status, 422);
                assert_eq!(error.as_deref(), Some("unresolvable reference"));
            }
            other => panic!("expected Fatal, got {other:?}"),
        }
    }
}
