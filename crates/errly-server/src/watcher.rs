//! Log watcher - discovery and subscription lifecycle.
//!
//! Owns the set of live log-stream subscriptions for one project. On a
//! periodic tick it discovers the active deployments, diffs them against
//! the current subscriptions, and opens/closes streams accordingly. Every
//! arriving line is fed to that deployment's trace assembler; completed
//! errors flow to the grouper and their summaries to the push hub.
//!
//! The assembler map is owned here exclusively: consumer tasks and idle
//! timers reach it only through this module, and a sweep step drops
//! assemblers whose deployment is no longer subscribed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use errly_core::{
    extract_endpoint, has_structured_info_level, AssembledError, Assembler, AssemblerState,
    CompletionCallback, ErrorEvent, ErrorSource, Severity, IDLE_FLUSH_MS,
};
use errly_platform::{CircuitState, Deployment, LogLine, LogSubscription, PlatformClient};
use errly_store::Store;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::grouper::ErrorGrouper;
use crate::hub::{PushEvent, PushHub};
use crate::meter::ErrorRateMeter;

/// Base discovery cadence.
pub const DISCOVERY_BASE_INTERVAL_SECS: u64 = 60;

/// Discovery cadence ceiling under backoff.
pub const DISCOVERY_MAX_INTERVAL_SECS: u64 = 300;

/// Health-monitor cadence.
pub const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Silence after which a live subscription is considered a zombie.
pub const ZOMBIE_SILENCE_MS: i64 = 10 * 60 * 1000;

/// Below this fraction of remaining rate budget, slow discovery down.
const RATE_SLOWDOWN_FRACTION: f64 = 0.2;

/// Above this fraction of remaining rate budget, return to base cadence.
const RATE_RECOVERY_FRACTION: f64 = 0.5;

/// Lifecycle state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Stream is delivering.
    Active,
    /// No messages for too long; being recycled.
    Zombie,
    /// Stream dropped; the transport is reconnecting.
    Reconnecting,
    /// Stream ended.
    Closed,
}

/// Snapshot of one subscription, for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    /// Deployment the stream belongs to.
    pub deployment_id: String,
    /// Service name (after alias mapping).
    pub service: String,
    /// Current lifecycle state.
    pub status: SubscriptionStatus,
    /// Epoch ms of the last received message.
    pub last_message_at: i64,
}

struct SubscriptionState {
    service_name: String,
    status: SubscriptionStatus,
    last_message_at: i64,
    generation: u64,
    cancel: CancellationToken,
}

struct AssemblerEntry {
    assembler: Assembler,
    idle_timer: Option<tokio::task::JoinHandle<()>>,
}

/// Watcher configuration, extracted from the service config.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Project whose deployments are watched.
    pub project_id: String,
    /// Only watch this environment, when set.
    pub environment_name: Option<String>,
    /// This service's own id; its deployments are never watched.
    pub self_service_id: Option<String>,
    /// Cap on concurrent subscriptions.
    pub max_subscriptions: usize,
}

/// Watches a project's deployments and feeds their logs through the
/// detection pipeline.
pub struct LogWatcher {
    platform: Arc<PlatformClient>,
    store: Store,
    grouper: Arc<ErrorGrouper>,
    hub: Arc<PushHub>,
    meter: Arc<ErrorRateMeter>,
    config: WatcherConfig,
    subscriptions: Mutex<HashMap<String, SubscriptionState>>,
    assemblers: Mutex<HashMap<String, AssemblerEntry>>,
    next_generation: AtomicU64,
    discovery_interval_secs: AtomicU64,
    last_discovery_at: AtomicI64,
    cancel: CancellationToken,
}

impl LogWatcher {
    /// Create a watcher. Call [`LogWatcher::start`] to begin discovery.
    #[must_use]
    pub fn new(
        platform: Arc<PlatformClient>,
        store: Store,
        grouper: Arc<ErrorGrouper>,
        hub: Arc<PushHub>,
        meter: Arc<ErrorRateMeter>,
        config: WatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            platform,
            store,
            grouper,
            hub,
            meter,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            assemblers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            discovery_interval_secs: AtomicU64::new(DISCOVERY_BASE_INTERVAL_SECS),
            last_discovery_at: AtomicI64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Run the initial discovery and start the periodic tasks.
    pub fn start(self: &Arc<Self>) {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher.run_discovery().await;
            loop {
                let secs = watcher.discovery_interval_secs.load(Ordering::Relaxed);
                tokio::select! {
                    () = watcher.cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(secs)) => {
                        watcher.run_discovery().await;
                    }
                }
            }
        });

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = watcher.cancel.cancelled() => return,
                    () = tokio::time::sleep(HEALTH_MONITOR_INTERVAL) => {
                        watcher.run_health_check().await;
                    }
                }
            }
        });
    }

    /// Stop discovery and close every subscription.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let subscriptions = self.subscriptions.lock().expect("watcher lock poisoned");
        for state in subscriptions.values() {
            state.cancel.cancel();
        }
    }

    /// One discovery tick.
    async fn run_discovery(self: &Arc<Self>) {
        if self.platform.breaker().state() == CircuitState::Open || self.platform.auth_error() {
            tracing::debug!("discovery skipped: platform client unavailable");
            self.raise_interval();
            return;
        }

        let deployments = match self
            .platform
            .project_deployments(&self.config.project_id)
            .await
        {
            Ok(deployments) => deployments,
            Err(e) => {
                tracing::warn!(error = %e, "deployment discovery failed");
                self.raise_interval();
                return;
            }
        };

        self.adapt_interval_to_rate_limit();

        let aliases = match self.store.service_aliases().await {
            Ok(aliases) => aliases,
            Err(e) => {
                tracing::warn!(error = %e, "could not read service aliases");
                HashMap::new()
            }
        };

        let desired = select_deployments(
            &deployments,
            self.config.environment_name.as_deref(),
            self.config.self_service_id.as_deref(),
        );
        self.reconcile(desired, &aliases);

        self.last_discovery_at
            .store(now_ms(), Ordering::Relaxed);
    }

    /// Diff the desired deployment set against current subscriptions.
    fn reconcile(self: &Arc<Self>, desired: Vec<Deployment>, aliases: &HashMap<String, String>) {
        let desired_ids: HashSet<&str> = desired.iter().map(|d| d.id.as_str()).collect();

        // Close and forget subscriptions for deployments that went away.
        let stale: Vec<String> = {
            let subscriptions = self.subscriptions.lock().expect("watcher lock poisoned");
            subscriptions
                .keys()
                .filter(|id| !desired_ids.contains(id.as_str()))
                .cloned()
                .collect()
        };
        for deployment_id in stale {
            tracing::info!(deployment_id = %deployment_id, "deployment gone; closing subscription");
            self.remove_subscription(&deployment_id);
        }

        for deployment in desired {
            let service_name = aliases
                .get(&deployment.service_name)
                .cloned()
                .unwrap_or_else(|| deployment.service_name.clone());

            let (needs_open, live) = {
                let subscriptions = self.subscriptions.lock().expect("watcher lock poisoned");
                let needs_open = match subscriptions.get(&deployment.id) {
                    None => true,
                    Some(state) => state.status == SubscriptionStatus::Closed,
                };
                let live = subscriptions
                    .values()
                    .filter(|s| s.status != SubscriptionStatus::Closed)
                    .count();
                (needs_open, live)
            };

            if !needs_open {
                continue;
            }
            if live >= self.config.max_subscriptions {
                tracing::warn!(
                    cap = self.config.max_subscriptions,
                    "subscription cap reached; remaining deployments not watched"
                );
                break;
            }
            self.open_subscription(deployment.id, service_name);
        }
    }

    /// Open a stream for one deployment and spawn its consumer task.
    fn open_subscription(self: &Arc<Self>, deployment_id: String, service_name: String) {
        let subscription = self.platform.subscribe_logs(&deployment_id);
        let cancel = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut subscriptions = self.subscriptions.lock().expect("watcher lock poisoned");
            if let Some(previous) = subscriptions.insert(
                deployment_id.clone(),
                SubscriptionState {
                    service_name: service_name.clone(),
                    status: SubscriptionStatus::Active,
                    last_message_at: now_ms(),
                    generation,
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
            }
        }
        {
            let mut assemblers = self.assemblers.lock().expect("watcher lock poisoned");
            let entry = assemblers
                .entry(deployment_id.clone())
                .or_insert_with(|| self.new_assembler_entry(&deployment_id, &service_name));
            // Keep the callback's service name current across alias
            // changes and reopens.
            entry
                .assembler
                .set_completion_callback(self.completion_callback(&deployment_id, &service_name));
        }

        tracing::info!(deployment_id = %deployment_id, service = %service_name, "log subscription opened");

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher
                .consume_subscription(deployment_id, service_name, subscription, generation, cancel)
                .await;
        });
    }

    /// Cancel a subscription's consumer and drop its assembler.
    fn remove_subscription(&self, deployment_id: &str) {
        if let Some(state) = self
            .subscriptions
            .lock()
            .expect("watcher lock poisoned")
            .remove(deployment_id)
        {
            state.cancel.cancel();
        }
        if let Some(entry) = self
            .assemblers
            .lock()
            .expect("watcher lock poisoned")
            .remove(deployment_id)
        {
            if let Some(timer) = entry.idle_timer {
                timer.abort();
            }
        }
    }

    /// Drive one subscription's batch sequence.
    async fn consume_subscription(
        self: Arc<Self>,
        deployment_id: String,
        service_name: String,
        mut subscription: LogSubscription,
        generation: u64,
        cancel: CancellationToken,
    ) {
        loop {
            let batch = tokio::select! {
                () = cancel.cancelled() => {
                    subscription.cancel();
                    return;
                }
                () = self.cancel.cancelled() => {
                    subscription.cancel();
                    return;
                }
                batch = subscription.next_batch() => batch,
            };

            let Some(batch) = batch else {
                self.mark_status(&deployment_id, generation, SubscriptionStatus::Closed);
                tracing::info!(deployment_id = %deployment_id, "log stream ended");
                return;
            };

            self.note_batch(&deployment_id, generation);
            for line in &batch {
                self.ingest_line(&deployment_id, &service_name, line).await;
            }
        }
    }

    fn note_batch(&self, deployment_id: &str, generation: u64) {
        let mut subscriptions = self.subscriptions.lock().expect("watcher lock poisoned");
        if let Some(state) = subscriptions.get_mut(deployment_id) {
            if state.generation == generation {
                state.last_message_at = now_ms();
                state.status = SubscriptionStatus::Active;
            }
        }
    }

    fn mark_status(&self, deployment_id: &str, generation: u64, status: SubscriptionStatus) {
        let mut subscriptions = self.subscriptions.lock().expect("watcher lock poisoned");
        if let Some(state) = subscriptions.get_mut(deployment_id) {
            if state.generation == generation {
                state.status = status;
            }
        }
    }

    /// Feed one line through this deployment's assembler; dispatch what
    /// the line itself completes. Out-of-band completions (stale-gap and
    /// idle-timeout flushes) arrive through the assembler's registered
    /// callback instead.
    async fn ingest_line(self: &Arc<Self>, deployment_id: &str, service_name: &str, line: &LogLine) {
        let now = now_ms();
        let (completed, collecting) = {
            let mut assemblers = self.assemblers.lock().expect("watcher lock poisoned");
            let entry = assemblers
                .entry(deployment_id.to_owned())
                .or_insert_with(|| self.new_assembler_entry(deployment_id, service_name));
            let completed = entry.assembler.feed(&line.message, now);
            let collecting = entry.assembler.state() == AssemblerState::Collecting;

            if let Some(timer) = entry.idle_timer.take() {
                timer.abort();
            }
            if collecting {
                entry.idle_timer = Some(self.spawn_idle_timer(deployment_id.to_owned()));
            }
            (completed, collecting)
        };

        let mut completed = completed;
        // The text classifier found nothing and no trace is open: fall
        // back to the platform's own severity for the line, unless the
        // body carries a structured info/debug level that contradicts it.
        if completed.is_none() && !collecting {
            if let Some(severity) = synthesised_severity(line) {
                completed = Some(AssembledError {
                    message: line.message.trim().to_owned(),
                    stack_trace: None,
                    severity,
                    endpoint: extract_endpoint(&line.message),
                    raw_log: line.message.clone(),
                });
            }
        }

        if let Some(error) = completed {
            dispatch_completed(
                &self.grouper,
                &self.hub,
                &self.meter,
                deployment_id,
                service_name,
                error,
            )
            .await;
        }
    }

    /// A fresh assembler wired to dispatch out-of-band completions.
    fn new_assembler_entry(&self, deployment_id: &str, service_name: &str) -> AssemblerEntry {
        AssemblerEntry {
            assembler: Assembler::with_completion_callback(
                self.completion_callback(deployment_id, service_name),
            ),
            idle_timer: None,
        }
    }

    /// The completion callback for one deployment's assembler.
    ///
    /// Invoked synchronously from inside the assembler (possibly under
    /// the assembler-map lock), so it only spawns the dispatch. Captures
    /// the pipeline handles rather than the watcher to avoid an Arc
    /// cycle through the assembler map.
    fn completion_callback(&self, deployment_id: &str, service_name: &str) -> CompletionCallback {
        let grouper = Arc::clone(&self.grouper);
        let hub = Arc::clone(&self.hub);
        let meter = Arc::clone(&self.meter);
        let deployment_id = deployment_id.to_owned();
        let service_name = service_name.to_owned();

        Box::new(move |error| {
            let grouper = Arc::clone(&grouper);
            let hub = Arc::clone(&hub);
            let meter = Arc::clone(&meter);
            let deployment_id = deployment_id.clone();
            let service_name = service_name.clone();
            tokio::spawn(async move {
                dispatch_completed(&grouper, &hub, &meter, &deployment_id, &service_name, error)
                    .await;
            });
        })
    }

    /// Arm the single pending idle-timeout for a deployment's assembler.
    ///
    /// The flush itself is delivered by the assembler's completion
    /// callback; this task only decides when to fire it.
    fn spawn_idle_timer(self: &Arc<Self>, deployment_id: String) -> tokio::task::JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            // A hair past the idle window so the flush check passes.
            tokio::time::sleep(Duration::from_millis(IDLE_FLUSH_MS as u64 + 50)).await;

            let mut assemblers = watcher.assemblers.lock().expect("watcher lock poisoned");
            if let Some(entry) = assemblers.get_mut(&deployment_id) {
                entry.assembler.fire_idle_timeout(now_ms());
            }
        })
    }

    /// Recycle zombie subscriptions and sweep orphaned assemblers.
    async fn run_health_check(self: &Arc<Self>) {
        let zombies = self.find_zombies(now_ms());
        for (deployment_id, service_name) in zombies {
            tracing::warn!(
                deployment_id = %deployment_id,
                "subscription silent for too long; reopening"
            );
            self.open_subscription(deployment_id, service_name);
        }

        // Assemblers for unsubscribed deployments leak; sweep them.
        let live: HashSet<String> = {
            let subscriptions = self.subscriptions.lock().expect("watcher lock poisoned");
            subscriptions.keys().cloned().collect()
        };
        let mut assemblers = self.assemblers.lock().expect("watcher lock poisoned");
        assemblers.retain(|deployment_id, entry| {
            let keep = live.contains(deployment_id);
            if !keep {
                if let Some(timer) = entry.idle_timer.take() {
                    timer.abort();
                }
            }
            keep
        });
    }

    /// Mark and collect subscriptions that went silent.
    fn find_zombies(&self, now: i64) -> Vec<(String, String)> {
        let mut subscriptions = self.subscriptions.lock().expect("watcher lock poisoned");
        let mut zombies = Vec::new();
        for (deployment_id, state) in subscriptions.iter_mut() {
            if state.status != SubscriptionStatus::Closed
                && now - state.last_message_at > ZOMBIE_SILENCE_MS
            {
                state.status = SubscriptionStatus::Zombie;
                state.cancel.cancel();
                zombies.push((deployment_id.clone(), state.service_name.clone()));
            }
        }
        zombies
    }

    fn raise_interval(&self) {
        let current = self.discovery_interval_secs.load(Ordering::Relaxed);
        let next = (current * 2).min(DISCOVERY_MAX_INTERVAL_SECS);
        if next != current {
            self.discovery_interval_secs.store(next, Ordering::Relaxed);
            tracing::info!(interval_secs = next, "discovery interval raised");
        }
    }

    fn reset_interval(&self) {
        let current = self.discovery_interval_secs.load(Ordering::Relaxed);
        if current != DISCOVERY_BASE_INTERVAL_SECS {
            self.discovery_interval_secs
                .store(DISCOVERY_BASE_INTERVAL_SECS, Ordering::Relaxed);
            tracing::info!(
                interval_secs = DISCOVERY_BASE_INTERVAL_SECS,
                "discovery interval reset"
            );
        }
    }

    fn adapt_interval_to_rate_limit(&self) {
        match self.platform.rate_limit().snapshot().available_fraction() {
            Some(fraction) if fraction < RATE_SLOWDOWN_FRACTION => self.raise_interval(),
            Some(fraction) if fraction > RATE_RECOVERY_FRACTION => self.reset_interval(),
            _ => {}
        }
    }

    /// Subscriptions currently not closed.
    #[must_use]
    pub fn active_subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("watcher lock poisoned")
            .values()
            .filter(|s| s.status != SubscriptionStatus::Closed)
            .count()
    }

    /// Snapshot of every subscription, for diagnostics.
    #[must_use]
    pub fn subscription_snapshot(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .lock()
            .expect("watcher lock poisoned")
            .iter()
            .map(|(deployment_id, state)| SubscriptionInfo {
                deployment_id: deployment_id.clone(),
                service: state.service_name.clone(),
                status: state.status,
                last_message_at: state.last_message_at,
            })
            .collect()
    }

    /// Epoch ms of the last successful discovery, if any.
    #[must_use]
    pub fn last_discovery_at(&self) -> Option<i64> {
        match self.last_discovery_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }
}

/// Group a completed error and push the result to dashboards.
///
/// Shared by the line-driven path in `ingest_line` and the assemblers'
/// out-of-band completion callbacks.
async fn dispatch_completed(
    grouper: &ErrorGrouper,
    hub: &PushHub,
    meter: &ErrorRateMeter,
    deployment_id: &str,
    service_name: &str,
    error: AssembledError,
) {
    let event = ErrorEvent {
        service: service_name.to_owned(),
        deployment_id: Some(deployment_id.to_owned()),
        message: error.message,
        stack_trace: error.stack_trace,
        severity: error.severity,
        endpoint: error.endpoint,
        raw_log: error.raw_log,
        source: ErrorSource::AutoCapture,
        metadata: None,
    };

    match grouper.process(event).await {
        Ok(outcome) => {
            meter.record(now_ms());
            let error = outcome.group.summary();
            if outcome.is_new {
                hub.broadcast(&PushEvent::NewError { error });
            } else {
                hub.broadcast(&PushEvent::ErrorUpdated { error });
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "error grouping failed");
        }
    }
}

/// Select the deployments worth watching: active statuses only, first
/// active per (service, environment), minus the filtered environment and
/// this service itself.
fn select_deployments(
    deployments: &[Deployment],
    environment: Option<&str>,
    self_service_id: Option<&str>,
) -> Vec<Deployment> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut selected = Vec::new();

    for deployment in deployments {
        if !deployment.status.is_active() {
            continue;
        }
        if let Some(env) = environment {
            if deployment.environment_name.as_deref() != Some(env) {
                continue;
            }
        }
        if let Some(self_id) = self_service_id {
            if deployment.service_id.as_deref() == Some(self_id) {
                continue;
            }
        }
        let key = (
            deployment
                .service_id
                .clone()
                .unwrap_or_else(|| deployment.service_name.clone()),
            deployment.environment_name.clone().unwrap_or_default(),
        );
        if seen.insert(key) {
            selected.push(deployment.clone());
        }
    }
    selected
}

/// Severity synthesis from the platform's line metadata.
///
/// Used only when the assembler produced nothing and is not collecting;
/// a structured info/debug level in the message body wins over the
/// platform's severity label.
fn synthesised_severity(line: &LogLine) -> Option<Severity> {
    let severity = match line.severity.as_deref()?.to_ascii_lowercase().as_str() {
        "error" => Severity::Error,
        "warn" | "warning" => Severity::Warn,
        "fatal" | "critical" => Severity::Fatal,
        _ => return None,
    };
    if has_structured_info_level(&line.message) {
        return None;
    }
    Some(severity)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use errly_platform::DeploymentStatus;

    fn deployment(id: &str, service: &str, env: &str, status: DeploymentStatus) -> Deployment {
        Deployment {
            id: id.to_owned(),
            service_id: Some(format!("svc-{service}")),
            service_name: service.to_owned(),
            environment_name: Some(env.to_owned()),
            status,
        }
    }

    #[test]
    fn selection_keeps_first_active_per_service_and_environment() {
        let deployments = vec![
            deployment("d1", "api", "production", DeploymentStatus::Success),
            deployment("d2", "api", "production", DeploymentStatus::Deploying),
            deployment("d3", "api", "staging", DeploymentStatus::Success),
            deployment("d4", "worker", "production", DeploymentStatus::Sleeping),
            deployment("d5", "worker", "production", DeploymentStatus::Crashed),
        ];
        let selected = select_deployments(&deployments, None, None);
        let ids: Vec<&str> = selected.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d3", "d4"]);
    }

    #[test]
    fn selection_skips_inactive_statuses() {
        let deployments = vec![
            deployment("d1", "api", "production", DeploymentStatus::Crashed),
            deployment("d2", "api", "production", DeploymentStatus::Removed),
            deployment("d3", "api", "production", DeploymentStatus::Failed),
        ];
        assert!(select_deployments(&deployments, None, None).is_empty());
    }

    #[test]
    fn selection_applies_environment_filter() {
        let deployments = vec![
            deployment("d1", "api", "production", DeploymentStatus::Success),
            deployment("d2", "api", "staging", DeploymentStatus::Success),
        ];
        let selected = select_deployments(&deployments, Some("staging"), None);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "d2");
    }

    #[test]
    fn selection_excludes_own_service() {
        let deployments = vec![
            deployment("d1", "api", "production", DeploymentStatus::Success),
            deployment("d2", "errly", "production", DeploymentStatus::Success),
        ];
        let selected = select_deployments(&deployments, None, Some("svc-errly"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "d1");
    }

    fn log_line(message: &str, severity: Option<&str>) -> LogLine {
        LogLine {
            message: message.to_owned(),
            severity: severity.map(str::to_owned),
            timestamp: None,
        }
    }

    #[test]
    fn severity_synthesis_maps_platform_levels() {
        assert_eq!(
            synthesised_severity(&log_line("something odd", Some("error"))),
            Some(Severity::Error)
        );
        assert_eq!(
            synthesised_severity(&log_line("something odd", Some("warning"))),
            Some(Severity::Warn)
        );
        assert_eq!(
            synthesised_severity(&log_line("something odd", Some("critical"))),
            Some(Severity::Fatal)
        );
        assert_eq!(synthesised_severity(&log_line("fine", Some("info"))), None);
        assert_eq!(synthesised_severity(&log_line("fine", None)), None);
    }

    #[test]
    fn severity_synthesis_respects_structured_info_body() {
        // stderr-routed info with an erroneous platform label stays out.
        assert_eq!(
            synthesised_severity(&log_line(r#"level=info msg="listening""#, Some("error"))),
            None
        );
    }

    async fn test_watcher() -> Arc<LogWatcher> {
        let store = Store::open_in_memory().await.unwrap();
        let platform = Arc::new(
            PlatformClient::new(errly_platform::PlatformConfig::new(
                secrecy::SecretString::from("token"),
            ))
            .unwrap(),
        );
        let grouper = Arc::new(ErrorGrouper::new(store.clone()));
        let hub = PushHub::new(store.clone(), 4);
        LogWatcher::new(
            platform,
            store,
            grouper,
            hub,
            Arc::new(ErrorRateMeter::new()),
            WatcherConfig {
                project_id: "proj".to_owned(),
                environment_name: None,
                self_service_id: None,
                max_subscriptions: 2,
            },
        )
    }

    #[tokio::test]
    async fn interval_doubles_and_caps() {
        let watcher = test_watcher().await;
        assert_eq!(
            watcher.discovery_interval_secs.load(Ordering::Relaxed),
            DISCOVERY_BASE_INTERVAL_SECS
        );
        watcher.raise_interval();
        assert_eq!(watcher.discovery_interval_secs.load(Ordering::Relaxed), 120);
        watcher.raise_interval();
        watcher.raise_interval();
        assert_eq!(
            watcher.discovery_interval_secs.load(Ordering::Relaxed),
            DISCOVERY_MAX_INTERVAL_SECS
        );
        watcher.reset_interval();
        assert_eq!(
            watcher.discovery_interval_secs.load(Ordering::Relaxed),
            DISCOVERY_BASE_INTERVAL_SECS
        );
    }

    #[tokio::test]
    async fn zombies_detected_by_silence() {
        let watcher = test_watcher().await;
        let now = now_ms();
        watcher.subscriptions.lock().unwrap().insert(
            "dep-1".to_owned(),
            SubscriptionState {
                service_name: "api".to_owned(),
                status: SubscriptionStatus::Active,
                last_message_at: now - ZOMBIE_SILENCE_MS - 1_000,
                generation: 1,
                cancel: CancellationToken::new(),
            },
        );
        watcher.subscriptions.lock().unwrap().insert(
            "dep-2".to_owned(),
            SubscriptionState {
                service_name: "worker".to_owned(),
                status: SubscriptionStatus::Active,
                last_message_at: now,
                generation: 2,
                cancel: CancellationToken::new(),
            },
        );

        let zombies = watcher.find_zombies(now);
        assert_eq!(zombies, vec![("dep-1".to_owned(), "api".to_owned())]);
        let snapshot = watcher.subscription_snapshot();
        let zombie = snapshot
            .iter()
            .find(|s| s.deployment_id == "dep-1")
            .unwrap();
        assert_eq!(zombie.status, SubscriptionStatus::Zombie);
    }

    #[tokio::test]
    async fn ingest_assembles_and_persists() {
        let watcher = test_watcher().await;
        watcher
            .ingest_line("dep-1", "api", &log_line("TypeError: x", None))
            .await;
        watcher
            .ingest_line("dep-1", "api", &log_line("    at f (a.ts:10:1)", None))
            .await;
        watcher
            .ingest_line("dep-1", "api", &log_line("request completed", None))
            .await;

        let page = watcher
            .store
            .list_groups(&Default::default(), i64::MAX)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.groups[0].message, "TypeError: x");
        assert!(page.groups[0]
            .stack_trace
            .as_deref()
            .unwrap()
            .contains("at f (a.ts:10:1)"));
    }

    #[tokio::test]
    async fn severity_metadata_synthesises_single_line_errors() {
        let watcher = test_watcher().await;
        watcher
            .ingest_line("dep-1", "api", &log_line("something broke", Some("error")))
            .await;
        watcher
            .ingest_line("dep-1", "api", &log_line("routine message", Some("info")))
            .await;

        let page = watcher
            .store
            .list_groups(&Default::default(), i64::MAX)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.groups[0].message, "something broke");
    }
}
