// sync.rs — Keeps the local rule cache in step with the authority.
//
// Session: register → catch-up pull → heartbeats, with pushed deltas applied
// as they arrive. Any transport failure ends the session; `run()` backs off
// exponentially and starts a new one, which always begins with a catch-up
// pull. Enforcement never waits on any of this: the enforcer keeps reading
// whatever snapshot the cache last committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::watch;

use aw_audit::{AuditBatch, AuditError, AuditRecord, AuditSink};
use aw_rules::{
    Heartbeat, HeartbeatAck, PullRequest, PullResponse, PushNotice, Registration, RuleSetVersion,
};

use crate::cache::{ApplyOutcome, RuleCache};
use crate::client::AuthorityClient;
use crate::enforcer::Enforcer;
use crate::error::AgentError;

/// Upper bound on records held for upload while the authority is away.
const MAX_PENDING_RECORDS: usize = 50_000;

/// Pull rounds per catch-up before giving up on convergence.
const MAX_CATCH_UP_ROUNDS: usize = 16;

/// Writes records to the local sink and queues copies for upload.
pub struct AuditOutbox {
    local: Arc<dyn AuditSink>,
    pending: Mutex<Vec<AuditRecord>>,
}

impl AuditOutbox {
    pub fn new(local: Arc<dyn AuditSink>) -> Self {
        Self {
            local,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<AuditRecord> {
        self.pending
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }

    /// Put back records whose upload failed, ahead of anything newer.
    pub fn requeue(&self, mut records: Vec<AuditRecord>) {
        if let Ok(mut pending) = self.pending.lock() {
            records.append(&mut pending);
            *pending = records;
            trim(&mut pending);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

fn trim(pending: &mut Vec<AuditRecord>) {
    if pending.len() > MAX_PENDING_RECORDS {
        let excess = pending.len() - MAX_PENDING_RECORDS;
        pending.drain(..excess);
        tracing::warn!(dropped = excess, "audit upload queue full; oldest records dropped");
    }
}

impl AuditSink for AuditOutbox {
    fn emit(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.local.emit(record.clone())?;
        let mut pending = self.pending.lock().map_err(|_| AuditError::Poisoned)?;
        pending.push(record);
        trim(&mut pending);
        Ok(())
    }
}

/// Sync loop tuning.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub endpoint_id: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub heartbeat_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub sweep_on_push: bool,
}

pub struct SyncClient {
    client: Arc<dyn AuthorityClient>,
    cache: Arc<RuleCache>,
    enforcer: Arc<Enforcer>,
    outbox: Option<Arc<AuditOutbox>>,
    settings: SyncSettings,
    connected: AtomicBool,
}

impl SyncClient {
    pub fn new(
        client: Arc<dyn AuthorityClient>,
        cache: Arc<RuleCache>,
        enforcer: Arc<Enforcer>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            client,
            cache,
            enforcer,
            outbox: None,
            settings,
            connected: AtomicBool::new(false),
        }
    }

    /// Upload queued audit records with every heartbeat.
    pub fn with_outbox(mut self, outbox: Arc<AuditOutbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Run sessions until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.settings.initial_backoff;
        loop {
            tokio::select! {
                result = self.session() => {
                    if let Err(e) = result {
                        tracing::warn!(
                            error = %e,
                            retry_in_ms = backoff.as_millis() as u64,
                            version = %self.cache.version(),
                            "authority unreachable; enforcing last applied rule set"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("sync loop stopping");
                    return;
                }
            }
            if self.connected.swap(false, Ordering::SeqCst) {
                backoff = self.settings.initial_backoff;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return,
            }
            backoff = next_backoff(backoff, self.settings.max_backoff);
        }
    }

    /// One connected session. Returns only on failure.
    pub async fn session(&self) -> Result<(), AgentError> {
        let ack = self
            .client
            .register(&Registration {
                endpoint_id: self.settings.endpoint_id.clone(),
                hostname: self.settings.hostname.clone(),
                capabilities: self.settings.capabilities.clone(),
                applied_version: self.cache.version(),
            })
            .await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            endpoint = %ack.endpoint_id,
            authority_version = %ack.current_version,
            applied = %self.cache.version(),
            "registered with authority"
        );

        self.catch_up().await?;

        let mut pushes = match self.client.subscribe(&self.settings.endpoint_id).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(error = %e, "push channel unavailable; relying on heartbeats");
                None
            }
        };

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.heartbeat_once().await?;
                }
                notice = next_push(&mut pushes) => match notice {
                    Some(Ok(notice)) => {
                        self.apply_push(&notice).await?;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "bad push notice; catching up by pull");
                        self.catch_up().await?;
                    }
                    None => {
                        return Err(AgentError::Delivery("push stream closed".to_string()));
                    }
                },
            }
        }
    }

    /// Pull until the cache holds the authority's current version.
    pub async fn catch_up(&self) -> Result<RuleSetVersion, AgentError> {
        for _ in 0..MAX_CATCH_UP_ROUNDS {
            let since = self.cache.version();
            let response = self
                .client
                .pull(&PullRequest {
                    endpoint_id: self.settings.endpoint_id.clone(),
                    since_version: since,
                })
                .await?;

            let mut applied = false;
            match response {
                PullResponse::UpToDate { version } => {
                    tracing::debug!(version = %version, "rule set up to date");
                    return Ok(self.cache.version());
                }
                PullResponse::Deltas { deltas } => {
                    for delta in &deltas {
                        match self.cache.apply_delta(delta)? {
                            ApplyOutcome::Applied(_) => applied = true,
                            ApplyOutcome::Ignored { .. } => {}
                            ApplyOutcome::Gap { .. } => break,
                        }
                    }
                }
                PullResponse::Snapshot { ruleset } => {
                    applied = self.cache.replace(ruleset)?.is_applied();
                }
            }

            if applied {
                self.after_apply().await?;
            } else if self.cache.version() == since {
                return Err(AgentError::Delivery(format!(
                    "pull since {} made no progress",
                    since
                )));
            }
        }
        Err(AgentError::Delivery(
            "catch-up did not converge".to_string(),
        ))
    }

    /// Apply a pushed delta. Duplicates are ignored; a gap triggers a pull.
    pub async fn apply_push(&self, notice: &PushNotice) -> Result<ApplyOutcome, AgentError> {
        let outcome = self.cache.apply_delta(&notice.delta)?;
        match outcome {
            ApplyOutcome::Applied(_) => self.after_apply().await?,
            ApplyOutcome::Ignored { .. } => {}
            ApplyOutcome::Gap { .. } => {
                self.catch_up().await?;
            }
        }
        Ok(outcome)
    }

    /// Upload queued audit records, then report liveness and version.
    pub async fn heartbeat_once(&self) -> Result<HeartbeatAck, AgentError> {
        if let Some(outbox) = &self.outbox {
            let records = outbox.take();
            if !records.is_empty() {
                let batch = AuditBatch {
                    endpoint_id: self.settings.endpoint_id.clone(),
                    records,
                };
                if let Err(e) = self.client.upload_audit(&batch).await {
                    outbox.requeue(batch.records);
                    return Err(e);
                }
                tracing::debug!(records = batch.records.len(), "uploaded audit records");
            }
        }

        let ruleset = self.cache.load();
        self.enforcer.domains().ensure(&ruleset).await;
        let ack = self
            .client
            .heartbeat(&Heartbeat {
                endpoint_id: self.settings.endpoint_id.clone(),
                applied_version: ruleset.version,
                stats: self.enforcer.stats(&ruleset),
                sent_at: Utc::now(),
            })
            .await?;
        if ack.behind {
            tracing::info!(
                applied = %ruleset.version,
                current = %ack.current_version,
                "behind authority; pulling"
            );
            self.catch_up().await?;
        }
        Ok(ack)
    }

    async fn after_apply(&self) -> Result<(), AgentError> {
        let ruleset = self.cache.load();
        self.enforcer.domains().ensure(&ruleset).await;
        if !self.settings.sweep_on_push {
            return Ok(());
        }
        match self.enforcer.sweep(&ruleset) {
            Ok(report) => {
                if !report.torn_down.is_empty() {
                    tracing::info!(
                        version = %ruleset.version,
                        checked = report.checked,
                        torn_down = report.torn_down.len(),
                        "sweep completed"
                    );
                }
                Ok(())
            }
            // Unblocked flows stay open for the next sweep; the session goes on.
            Err(e @ AgentError::SweepIncomplete { .. }) => {
                tracing::warn!(version = %ruleset.version, error = %e, "sweep incomplete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn next_push(
    pushes: &mut Option<crate::client::PushStream>,
) -> Option<Result<PushNotice, AgentError>> {
    match pushes.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
