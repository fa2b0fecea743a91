//! One reconciliation pass over a partition.
//!
//! A pass takes the partition lock, loads the snapshot records, fetches live
//! attributes concurrently, diffs, plans and (in apply mode) executes the plan
//! in order. The lock is released on every exit path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::diff::{ResourceDiff, diff_resource};
use crate::error::DriftError;
use crate::lock::{LockCoordinator, acquire_with_timeout};
use crate::plan::{self, ActionKind, Plan, PlannedAction};
use crate::providers::{Change, Provider, ProviderError};
use crate::resource::{
    Attributes, DeclaredResource, LiveObservation, ProviderRefs, ReconcileConfig, ResourceRecord,
    validate_declarations,
};
use crate::retry::{Exhausted, retry_with_hint};
use crate::store::{SnapshotStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Diff and plan only.
    Plan,
    /// Diff, plan and execute the plan.
    Apply,
}

/// A resource whose provider call kept failing. Other resources proceed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("reconciliation of '{resource_id}' failed after {attempts} attempt(s): {message}")]
pub struct ReconciliationFailed {
    pub resource_id: String,
    pub attempts: u32,
    pub message: String,
}

impl ReconciliationFailed {
    fn new(resource_id: &str, exhausted: Exhausted<ProviderError>) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            attempts: exhausted.attempts,
            message: exhausted.last_error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub partition: String,
    pub diffs: Vec<ResourceDiff>,
    pub plan: Plan,
    pub failures: Vec<ReconciliationFailed>,
    pub applied: Vec<PlannedAction>,
    /// Actions not attempted because something they depend on failed.
    pub skipped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.plan.is_empty() && self.failures.is_empty()
    }
}

enum Fetched {
    Live(LiveObservation),
    Gone,
    Failed(ReconciliationFailed),
}

pub struct Reconciler {
    provider: Arc<dyn Provider>,
    store: Arc<dyn SnapshotStore>,
    locks: Arc<dyn LockCoordinator>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn SnapshotStore>,
        locks: Arc<dyn LockCoordinator>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            provider,
            store,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn run(
        &self,
        partition: &str,
        declared: &[DeclaredResource],
        mode: RunMode,
    ) -> Result<ReconcileReport, DriftError> {
        validate_declarations(declared)?;
        with_lock(self.locks.as_ref(), &self.config, partition, || {
            self.run_locked(partition, declared, mode)
        })
        .await
    }

    async fn run_locked(
        &self,
        partition: &str,
        declared: &[DeclaredResource],
        mode: RunMode,
    ) -> Result<ReconcileReport, DriftError> {
        let records: BTreeMap<String, ResourceRecord> = self
            .store
            .list(partition)?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let targets: Vec<(String, String)> = declared
            .iter()
            .filter_map(|d| {
                records
                    .get(&d.id)
                    .map(|record| (d.id.clone(), record.provider_ref.clone()))
            })
            .collect();
        let mut fetched = self.fetch_all(targets).await?;
        let refs = ProviderRefs::new(declared, records.values());

        let mut report = ReconcileReport {
            partition: partition.to_string(),
            ..Default::default()
        };

        for resource in declared {
            let live = match fetched.remove(&resource.id) {
                Some(Fetched::Failed(failure)) => {
                    report.failures.push(failure);
                    continue;
                }
                Some(Fetched::Live(live)) => Some(live),
                Some(Fetched::Gone) | None => None,
            };
            report.diffs.push(diff_resource(
                resource,
                records.get(&resource.id),
                live.as_ref(),
                &refs,
            ));
        }

        let declared_ids: BTreeSet<&str> = declared.iter().map(|d| d.id.as_str()).collect();
        report.diffs.extend(
            records
                .values()
                .filter(|record| !declared_ids.contains(record.id.as_str()))
                .map(ResourceDiff::orphaned),
        );
        report
            .diffs
            .sort_by(|a, b| a.resource_id.cmp(&b.resource_id));

        report.plan = plan::plan(&report.diffs, self.config.external_drift)?;

        tracing::info!(
            partition,
            resources = report.diffs.len(),
            actions = report.plan.actions.len(),
            review = report.plan.review.len(),
            failures = report.failures.len(),
            "plan ready"
        );

        if mode == RunMode::Apply {
            self.apply_plan(partition, declared, &records, &refs, &mut report)
                .await?;
        }

        Ok(report)
    }

    /// Fetch live attributes for `(resource_id, provider_ref)` pairs,
    /// at most `concurrency` at a time, retrying transient errors.
    async fn fetch_all(
        &self,
        targets: Vec<(String, String)>,
    ) -> Result<BTreeMap<String, Fetched>, DriftError> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (resource_id, provider_ref) in targets {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let policy = self.config.retry;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = retry_with_hint(
                    &policy,
                    ProviderError::is_transient,
                    ProviderError::retry_after,
                    || provider.fetch(&provider_ref),
                )
                .await;
                (resource_id, result)
            });
        }

        let mut fetched = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (resource_id, result) = joined?;
            let outcome = match result {
                Ok(live) => Fetched::Live(live),
                Err(Exhausted {
                    last_error: ProviderError::NotFound(_),
                    ..
                }) => Fetched::Gone,
                Err(exhausted) => {
                    let failure = ReconciliationFailed::new(&resource_id, exhausted);
                    tracing::warn!(resource_id = %resource_id, attempts = failure.attempts, error = %failure.message, "fetch failed");
                    Fetched::Failed(failure)
                }
            };
            fetched.insert(resource_id, outcome);
        }
        Ok(fetched)
    }

    async fn apply_plan(
        &self,
        partition: &str,
        declared: &[DeclaredResource],
        records: &BTreeMap<String, ResourceRecord>,
        refs: &ProviderRefs,
        report: &mut ReconcileReport,
    ) -> Result<(), DriftError> {
        let declared_by_id: BTreeMap<&str, &DeclaredResource> =
            declared.iter().map(|d| (d.id.as_str(), d)).collect();
        let mut failed: BTreeSet<String> = report
            .failures
            .iter()
            .map(|f| f.resource_id.clone())
            .collect();

        for action in &report.plan.actions {
            let id = action.resource_id.as_str();
            if let Some(blocker) = action.depends_on.iter().find(|dep| failed.contains(*dep)) {
                tracing::warn!(resource_id = id, blocked_by = %blocker, "skipping action");
                failed.insert(action.resource_id.clone());
                report.skipped.push(action.resource_id.clone());
                continue;
            }

            let change = match action.kind {
                ActionKind::Delete => records.get(id).map(delete_change),
                _ => declared_by_id
                    .get(id)
                    .map(|resource| change_for(action, resource, refs)),
            };
            let Some(change) = change else {
                continue;
            };

            if action.kind.touches_provider() {
                self.hold_lock(partition)?;
                if let Err(failure) = self.push(&change).await {
                    failed.insert(action.resource_id.clone());
                    report.failures.push(failure);
                    continue;
                }
            }

            self.hold_lock(partition)?;
            if action.kind == ActionKind::Delete {
                self.store.remove(partition, id).or_else(ignore_missing)?;
            } else if let Some(resource) = declared_by_id.get(id) {
                let record = next_record(action, resource, records.get(id));
                self.store.save(partition, &record)?;
            }
            tracing::info!(partition, resource_id = id, action = %action.kind, "snapshot updated");
            report.applied.push(action.clone());
        }

        Ok(())
    }

    /// Extend the partition lock before a write, failing if it was lost.
    fn hold_lock(&self, partition: &str) -> Result<(), DriftError> {
        self.locks
            .renew(partition, &self.config.holder_id, self.config.lock_ttl)
            .map_err(|err| {
                tracing::error!(partition, error = %err, "lock lost, aborting apply");
                DriftError::from(err)
            })?;
        Ok(())
    }

    async fn push(&self, change: &Change) -> Result<(), ReconciliationFailed> {
        retry_with_hint(
            &self.config.retry,
            ProviderError::is_transient,
            ProviderError::retry_after,
            || self.provider.apply(change),
        )
        .await
        .map_err(|exhausted| {
            let failure = ReconciliationFailed::new(&change.resource_id, exhausted);
            tracing::warn!(
                resource_id = %change.resource_id,
                action = %change.kind,
                attempts = failure.attempts,
                error = %failure.message,
                "apply failed"
            );
            failure
        })
    }
}

fn ignore_missing(err: StoreError) -> Result<(), StoreError> {
    match err {
        StoreError::NotFound { .. } => Ok(()),
        other => Err(other),
    }
}

fn delete_change(record: &ResourceRecord) -> Change {
    Change {
        kind: ActionKind::Delete,
        resource_id: record.id.clone(),
        resource_type: record.resource_type.clone(),
        provider_ref: record.provider_ref.clone(),
        attributes: Attributes::new(),
        removed: Vec::new(),
    }
}

/// Build the provider write for a non-delete action. References are sent as
/// the provider ref of the resource they point at.
fn change_for(
    action: &PlannedAction,
    resource: &DeclaredResource,
    refs: &ProviderRefs,
) -> Change {
    let (attributes, removed) = match action.kind {
        ActionKind::Create | ActionKind::Recreate => {
            (refs.resolve(&resource.attributes), Vec::new())
        }
        _ => {
            let mut attributes = Attributes::new();
            let mut removed = Vec::new();
            for field in &action.fields {
                match resource.attributes.get(field) {
                    Some(value) => {
                        attributes.insert(field.clone(), value.resolve(refs));
                    }
                    None => removed.push(field.clone()),
                }
            }
            (attributes, removed)
        }
    };

    Change {
        kind: action.kind,
        resource_id: resource.id.clone(),
        resource_type: resource.resource_type.clone(),
        provider_ref: resource.provider_ref.clone(),
        attributes,
        removed,
    }
}

/// The snapshot after `action` succeeded. Only the planned fields move to
/// their declared values; unplanned fields keep what was last applied.
fn next_record(
    action: &PlannedAction,
    resource: &DeclaredResource,
    previous: Option<&ResourceRecord>,
) -> ResourceRecord {
    let last_applied_attributes = match (action.kind, previous) {
        (ActionKind::Create | ActionKind::Recreate, _) | (_, None) => resource.attributes.clone(),
        (_, Some(previous)) => {
            let mut applied = previous.last_applied_attributes.clone();
            for field in &action.fields {
                match resource.attributes.get(field) {
                    Some(value) => {
                        applied.insert(field.clone(), value.clone());
                    }
                    None => {
                        applied.remove(field);
                    }
                }
            }
            applied
        }
    };

    let provider_ref = match (action.kind, previous) {
        (ActionKind::Create | ActionKind::Recreate, _) | (_, None) => resource.provider_ref.clone(),
        (_, Some(previous)) => previous.provider_ref.clone(),
    };

    ResourceRecord {
        id: resource.id.clone(),
        resource_type: resource.resource_type.clone(),
        provider_ref,
        declared_attributes: resource.attributes.clone(),
        last_applied_attributes,
    }
}

/// Run `f` while holding the partition lock. The lock is released whether
/// `f` succeeds or fails.
pub async fn with_lock<T, F, Fut>(
    locks: &dyn LockCoordinator,
    config: &ReconcileConfig,
    partition: &str,
    f: F,
) -> Result<T, DriftError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, DriftError>>,
{
    let token = acquire_with_timeout(
        locks,
        partition,
        &config.holder_id,
        config.lock_ttl,
        config.lock_timeout,
        &config.lock_retry,
    )
    .await?;

    let result = f().await;
    let released = locks.release(partition, &token.holder_id);

    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => {
            tracing::error!(partition, error = %err, "lock lost during pass");
            Err(err.into())
        }
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            tracing::warn!(partition, error = %release_err, "failed to release lock");
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: Vec<String>,
    pub skipped: Vec<String>,
}

/// Seed the snapshot store with records, e.g. from a tfstate file.
///
/// Existing ids are left alone unless `replace` is set.
pub async fn import_records(
    store: &dyn SnapshotStore,
    locks: &dyn LockCoordinator,
    config: &ReconcileConfig,
    partition: &str,
    records: Vec<ResourceRecord>,
    replace: bool,
) -> Result<ImportSummary, DriftError> {
    with_lock(locks, config, partition, || async move {
        import_into(store, partition, records, replace)
    })
    .await
}

fn import_into(
    store: &dyn SnapshotStore,
    partition: &str,
    records: Vec<ResourceRecord>,
    replace: bool,
) -> Result<ImportSummary, DriftError> {
    let existing: BTreeSet<String> = store
        .list(partition)?
        .into_iter()
        .map(|record| record.id)
        .collect();

    let mut summary = ImportSummary::default();
    for record in records {
        if existing.contains(&record.id) && !replace {
            summary.skipped.push(record.id);
            continue;
        }
        store.save(partition, &record)?;
        summary.imported.push(record.id);
    }

    tracing::info!(
        partition,
        imported = summary.imported.len(),
        skipped = summary.skipped.len(),
        "import complete"
    );
    Ok(summary)
}

/// Forget a resource without touching the provider.
pub async fn remove_record(
    store: &dyn SnapshotStore,
    locks: &dyn LockCoordinator,
    config: &ReconcileConfig,
    partition: &str,
    resource_id: &str,
) -> Result<(), DriftError> {
    with_lock(locks, config, partition, || async move {
        store.remove(partition, resource_id).map_err(DriftError::from)
    })
    .await?;
    tracing::info!(partition, resource_id, "record removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffOutcome;
    use crate::resource::AttributeValue;
    use crate::lock::{LockError, MemoryLockCoordinator};
    use crate::plan::{ExternalDriftPolicy, PlanError};
    use crate::providers::fixture::FixtureProvider;
    use crate::retry::RetryPolicy;
    use crate::store::MemorySnapshotStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn attrs(json: serde_json::Value) -> Attributes {
        serde_json::from_value(json).unwrap()
    }

    fn declared(id: &str, json: serde_json::Value) -> DeclaredResource {
        DeclaredResource {
            id: id.to_string(),
            resource_type: "volume".to_string(),
            provider_ref: format!("ref-{id}"),
            attributes: attrs(json),
        }
    }

    fn test_config() -> ReconcileConfig {
        ReconcileConfig {
            holder_id: "test-holder".to_string(),
            lock_timeout: Duration::from_millis(50),
            lock_retry: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
            retry: RetryPolicy::no_delay(3),
            ..Default::default()
        }
    }

    /// Fails `fetch` transiently a set number of times per provider ref.
    struct Flaky {
        inner: Arc<FixtureProvider>,
        remaining: Mutex<HashMap<String, u32>>,
    }

    impl Flaky {
        fn new(inner: Arc<FixtureProvider>, failures: &[(&str, u32)]) -> Self {
            Self {
                inner,
                remaining: Mutex::new(
                    failures
                        .iter()
                        .map(|(r, n)| (r.to_string(), *n))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl Provider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(&self, provider_ref: &str) -> Result<LiveObservation, ProviderError> {
            {
                let mut remaining = self.remaining.lock().unwrap();
                if let Some(n) = remaining.get_mut(provider_ref) {
                    if *n > 0 {
                        *n -= 1;
                        return Err(ProviderError::Transient("503 Service Unavailable".into()));
                    }
                }
            }
            self.inner.fetch(provider_ref).await
        }

        async fn apply(&self, change: &Change) -> Result<(), ProviderError> {
            self.inner.apply(change).await
        }
    }

    /// Sleeps before every provider call.
    struct Slow {
        inner: Arc<FixtureProvider>,
        fetch_delay: Duration,
        apply_delay: Duration,
    }

    #[async_trait]
    impl Provider for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, provider_ref: &str) -> Result<LiveObservation, ProviderError> {
            tokio::time::sleep(self.fetch_delay).await;
            self.inner.fetch(provider_ref).await
        }

        async fn apply(&self, change: &Change) -> Result<(), ProviderError> {
            tokio::time::sleep(self.apply_delay).await;
            self.inner.apply(change).await
        }
    }

    struct Harness {
        live: Arc<FixtureProvider>,
        store: Arc<MemorySnapshotStore>,
        locks: Arc<MemoryLockCoordinator>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                live: Arc::new(FixtureProvider::default()),
                store: Arc::new(MemorySnapshotStore::new()),
                locks: Arc::new(MemoryLockCoordinator::new()),
            }
        }

        fn reconciler(&self, config: ReconcileConfig) -> Reconciler {
            self.reconciler_with(self.live.clone(), config)
        }

        fn reconciler_with(&self, provider: Arc<dyn Provider>, config: ReconcileConfig) -> Reconciler {
            Reconciler::new(provider, self.store.clone(), self.locks.clone(), config)
        }

        fn record(&self, id: &str) -> ResourceRecord {
            self.store.load("prod", id).unwrap()
        }
    }

    fn network_and_volume() -> Vec<DeclaredResource> {
        vec![
            declared("volume", serde_json::json!({"size": 10, "net": {"$ref": "network"}})),
            declared("network", serde_json::json!({"cidr": "10.0.0.0/16"})),
        ]
    }

    #[tokio::test]
    async fn test_first_apply_creates_in_dependency_order() {
        let h = Harness::new();
        let report = h
            .reconciler(test_config())
            .run("prod", &network_and_volume(), RunMode::Apply)
            .await
            .unwrap();

        let applied: Vec<_> = report
            .applied
            .iter()
            .map(|a| (a.resource_id.as_str(), a.kind))
            .collect();
        assert_eq!(
            applied,
            vec![("network", ActionKind::Create), ("volume", ActionKind::Create)]
        );
        assert_eq!(h.live.get("ref-volume").unwrap()["size"], AttributeValue::Int(10));
        assert_eq!(h.record("volume").last_applied_attributes["size"], AttributeValue::Int(10));
        assert!(h.locks.current("prod").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_pass_is_clean() {
        let h = Harness::new();
        let reconciler = h.reconciler(test_config());
        reconciler
            .run("prod", &network_and_volume(), RunMode::Apply)
            .await
            .unwrap();

        let report = reconciler
            .run("prod", &network_and_volume(), RunMode::Plan)
            .await
            .unwrap();
        assert!(report.is_clean());
        assert!(report.diffs.iter().all(ResourceDiff::is_in_sync));
    }

    #[tokio::test]
    async fn test_external_drift_is_reverted() {
        let h = Harness::new();
        let reconciler = h.reconciler(test_config());
        let resources = vec![declared("disk", serde_json::json!({"size": 10}))];
        reconciler.run("prod", &resources, RunMode::Apply).await.unwrap();

        h.live.set("ref-disk", attrs(serde_json::json!({"size": 20})));
        let report = reconciler.run("prod", &resources, RunMode::Apply).await.unwrap();

        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].kind, ActionKind::Revert);
        assert_eq!(h.live.get("ref-disk").unwrap()["size"], AttributeValue::Int(10));
    }

    #[tokio::test]
    async fn test_external_drift_reported_only() {
        let h = Harness::new();
        let resources = vec![declared("disk", serde_json::json!({"size": 10}))];
        h.reconciler(test_config())
            .run("prod", &resources, RunMode::Apply)
            .await
            .unwrap();

        h.live.set("ref-disk", attrs(serde_json::json!({"size": 20})));
        let config = ReconcileConfig {
            external_drift: ExternalDriftPolicy::Report,
            ..test_config()
        };
        let report = h
            .reconciler(config)
            .run("prod", &resources, RunMode::Apply)
            .await
            .unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(report.plan.reported.len(), 1);
        assert_eq!(h.live.get("ref-disk").unwrap()["size"], AttributeValue::Int(20));
    }

    #[tokio::test]
    async fn test_config_drift_updates_snapshot() {
        let h = Harness::new();
        let reconciler = h.reconciler(test_config());
        reconciler
            .run("prod", &[declared("disk", serde_json::json!({"size": 10, "tier": "ssd"}))], RunMode::Apply)
            .await
            .unwrap();

        let changed = vec![declared("disk", serde_json::json!({"size": 30}))];
        let report = reconciler.run("prod", &changed, RunMode::Apply).await.unwrap();

        assert_eq!(report.applied[0].kind, ActionKind::Update);
        assert_eq!(report.applied[0].fields, vec!["size", "tier"]);
        let live = h.live.get("ref-disk").unwrap();
        assert_eq!(live["size"], AttributeValue::Int(30));
        assert!(!live.contains_key("tier"));
        assert_eq!(h.record("disk").last_applied_attributes, attrs(serde_json::json!({"size": 30})));
    }

    #[tokio::test]
    async fn test_conflicts_are_never_applied() {
        let h = Harness::new();
        let reconciler = h.reconciler(test_config());
        reconciler
            .run("prod", &[declared("disk", serde_json::json!({"size": 10}))], RunMode::Apply)
            .await
            .unwrap();

        h.live.set("ref-disk", attrs(serde_json::json!({"size": 20})));
        let report = reconciler
            .run("prod", &[declared("disk", serde_json::json!({"size": 30}))], RunMode::Apply)
            .await
            .unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(report.plan.review.len(), 1);
        assert_eq!(h.live.get("ref-disk").unwrap()["size"], AttributeValue::Int(20));
        assert_eq!(h.record("disk").last_applied_attributes["size"], AttributeValue::Int(10));
    }

    #[tokio::test]
    async fn test_missing_resource_is_recreated() {
        let h = Harness::new();
        let reconciler = h.reconciler(test_config());
        let resources = vec![declared("disk", serde_json::json!({"size": 10}))];
        reconciler.run("prod", &resources, RunMode::Apply).await.unwrap();

        h.live
            .apply(&Change {
                kind: ActionKind::Delete,
                resource_id: "disk".to_string(),
                resource_type: "volume".to_string(),
                provider_ref: "ref-disk".to_string(),
                attributes: Attributes::new(),
                removed: Vec::new(),
            })
            .await
            .unwrap();

        let report = reconciler.run("prod", &resources, RunMode::Apply).await.unwrap();
        assert!(matches!(report.diffs[0].outcome, DiffOutcome::Missing));
        assert_eq!(report.applied[0].kind, ActionKind::Recreate);
        assert!(h.live.get("ref-disk").is_some());
    }

    #[tokio::test]
    async fn test_orphan_is_deleted_and_forgotten() {
        let h = Harness::new();
        let reconciler = h.reconciler(test_config());
        reconciler
            .run("prod", &network_and_volume(), RunMode::Apply)
            .await
            .unwrap();

        let report = reconciler
            .run("prod", &network_and_volume()[1..], RunMode::Apply)
            .await
            .unwrap();

        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].kind, ActionKind::Delete);
        assert!(h.live.get("ref-volume").is_none());
        assert!(matches!(
            h.store.load("prod", "volume"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_within_budget_are_invisible() {
        let h = Harness::new();
        h.reconciler(test_config())
            .run("prod", &network_and_volume(), RunMode::Apply)
            .await
            .unwrap();

        let flaky = Arc::new(Flaky::new(h.live.clone(), &[("ref-volume", 2)]));
        let report = h
            .reconciler_with(flaky, test_config())
            .run("prod", &network_and_volume(), RunMode::Plan)
            .await
            .unwrap();

        assert!(report.failures.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_one_resource_only() {
        let h = Harness::new();
        let resources = vec![
            declared("network", serde_json::json!({"cidr": "10.0.0.0/16"})),
            declared("volume", serde_json::json!({"size": 10, "net": {"$ref": "network"}})),
            declared("backup", serde_json::json!({"keep": 7})),
        ];
        h.reconciler(test_config())
            .run("prod", &resources, RunMode::Apply)
            .await
            .unwrap();

        let mut changed = resources.clone();
        changed[1].attributes.insert("size".to_string(), AttributeValue::Int(20));
        changed[2].attributes.insert("keep".to_string(), AttributeValue::Int(14));

        let flaky = Arc::new(Flaky::new(h.live.clone(), &[("ref-network", 10)]));
        let report = h
            .reconciler_with(flaky, test_config())
            .run("prod", &changed, RunMode::Apply)
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].resource_id, "network");
        assert_eq!(report.failures[0].attempts, 3);
        assert_eq!(report.skipped, vec!["volume"]);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].resource_id, "backup");
        assert_eq!(h.live.get("ref-volume").unwrap()["size"], AttributeValue::Int(10));
    }

    #[tokio::test]
    async fn test_lock_released_after_failed_pass() {
        let h = Harness::new();
        let cyclic = vec![
            declared("a", serde_json::json!({"peer": {"$ref": "b"}})),
            declared("b", serde_json::json!({"peer": {"$ref": "a"}})),
        ];

        let err = h
            .reconciler(test_config())
            .run("prod", &cyclic, RunMode::Apply)
            .await
            .unwrap_err();

        assert!(matches!(err, DriftError::Plan(PlanError::CycleDetected { .. })));
        assert!(h.locks.current("prod").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over_stops_writes() {
        let h = Harness::new();
        let resources = vec![declared("disk", serde_json::json!({"size": 1}))];
        h.reconciler(test_config())
            .run("prod", &resources, RunMode::Apply)
            .await
            .unwrap();
        h.live.set("ref-disk", attrs(serde_json::json!({"size": 2})));

        let config = ReconcileConfig {
            lock_ttl: Duration::from_millis(50),
            ..test_config()
        };
        let slow = Arc::new(Slow {
            inner: h.live.clone(),
            fetch_delay: Duration::from_millis(200),
            apply_delay: Duration::ZERO,
        });
        let locks = h.locks.clone();
        let other = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            locks.acquire("prod", "other-holder", Duration::from_secs(60))
        });

        let result = h
            .reconciler_with(slow, config)
            .run("prod", &resources, RunMode::Apply)
            .await;
        other.await.unwrap().unwrap();

        assert!(matches!(
            result,
            Err(DriftError::Lock(LockError::NotHolder { .. }))
        ));
        assert_eq!(h.live.get("ref-disk").unwrap()["size"], AttributeValue::Int(2));
        assert_eq!(h.record("disk").last_applied_attributes["size"], AttributeValue::Int(1));
        assert_eq!(
            h.locks.current("prod").unwrap().unwrap().holder_id,
            "other-holder"
        );
    }

    #[tokio::test]
    async fn test_lock_renewed_across_slow_apply() {
        let h = Harness::new();
        let config = ReconcileConfig {
            lock_ttl: Duration::from_millis(60),
            ..test_config()
        };
        let slow = Arc::new(Slow {
            inner: h.live.clone(),
            fetch_delay: Duration::ZERO,
            apply_delay: Duration::from_millis(25),
        });
        let resources = vec![
            declared("a", serde_json::json!({"n": 1})),
            declared("b", serde_json::json!({"n": 2})),
            declared("c", serde_json::json!({"n": 3})),
            declared("d", serde_json::json!({"n": 4})),
        ];

        let report = h
            .reconciler_with(slow, config)
            .run("prod", &resources, RunMode::Apply)
            .await
            .unwrap();

        assert_eq!(report.applied.len(), 4);
        assert_eq!(h.store.list("prod").unwrap().len(), 4);
        assert!(h.locks.current("prod").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_references_applied_as_provider_refs() {
        let h = Harness::new();
        h.reconciler(test_config())
            .run("prod", &network_and_volume(), RunMode::Apply)
            .await
            .unwrap();

        assert_eq!(
            h.live.get("ref-volume").unwrap()["net"],
            AttributeValue::String("ref-network".to_string())
        );
        assert_eq!(
            h.record("volume").last_applied_attributes["net"],
            AttributeValue::Reference("network".to_string())
        );
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let h = Harness::new();
        h.locks
            .acquire("prod", "someone-else", Duration::from_secs(60))
            .unwrap();

        let err = h
            .reconciler(test_config())
            .run("prod", &network_and_volume(), RunMode::Plan)
            .await
            .unwrap_err();

        assert!(matches!(err, DriftError::Lock(LockError::Timeout { .. })));
        assert_eq!(
            h.locks.current("prod").unwrap().unwrap().holder_id,
            "someone-else"
        );
    }

    #[tokio::test]
    async fn test_plan_mode_writes_nothing() {
        let h = Harness::new();
        let report = h
            .reconciler(test_config())
            .run("prod", &network_and_volume(), RunMode::Plan)
            .await
            .unwrap();

        assert_eq!(report.plan.actions.len(), 2);
        assert!(report.applied.is_empty());
        assert!(h.live.get("ref-network").is_none());
        assert!(h.store.list("prod").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_skips_existing_unless_replace() {
        let h = Harness::new();
        let config = test_config();
        let record = |size: i64| ResourceRecord {
            id: "disk".to_string(),
            resource_type: "volume".to_string(),
            provider_ref: "ref-disk".to_string(),
            declared_attributes: attrs(serde_json::json!({"size": size})),
            last_applied_attributes: attrs(serde_json::json!({"size": size})),
        };

        let first = import_records(h.store.as_ref(), h.locks.as_ref(), &config, "prod", vec![record(1)], false)
            .await
            .unwrap();
        assert_eq!(first.imported, vec!["disk"]);

        let second = import_records(h.store.as_ref(), h.locks.as_ref(), &config, "prod", vec![record(2)], false)
            .await
            .unwrap();
        assert_eq!(second.skipped, vec!["disk"]);
        assert_eq!(h.record("disk").last_applied_attributes["size"], AttributeValue::Int(1));

        import_records(h.store.as_ref(), h.locks.as_ref(), &config, "prod", vec![record(2)], true)
            .await
            .unwrap();
        assert_eq!(h.record("disk").last_applied_attributes["size"], AttributeValue::Int(2));

        remove_record(h.store.as_ref(), h.locks.as_ref(), &config, "prod", "disk")
            .await
            .unwrap();
        assert!(h.store.list("prod").unwrap().is_empty());
        assert!(h.locks.current("prod").unwrap().is_none());
    }
}
