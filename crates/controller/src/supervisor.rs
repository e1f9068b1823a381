//! Scope wiring: one watch, cache, queue and worker pool per configured scope.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use kew_core::{ChangeType, ConfigError, QueueItem, WatchConfig, WatchEvent};
use kew_filter::{compile_optional, ExtraFilter};
use kew_kubehub::{field_selector, spawn_event_watch};
use kew_queue::WorkQueue;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{Controller, DecisionEngine, DecisionPolicy, Renderer, SinkSet};

/// A scope with its filter compiled and policy resolved.
#[derive(Debug, Clone)]
pub struct ScopeSpec {
    pub name: String,
    pub config: WatchConfig,
    pub filter: Option<ExtraFilter>,
    pub policy: DecisionPolicy,
}

impl ScopeSpec {
    pub fn compile(index: usize, config: WatchConfig) -> Result<Self, ConfigError> {
        let name = config.scope_name(index);
        let filter = compile_optional(config.extra_filter.as_ref()).map_err(|e| ConfigError::Filter { scope: name.clone(), reason: e.to_string() })?;
        Ok(Self { name, policy: DecisionPolicy::for_scope(&config), filter, config })
    }
}

/// Compile every scope, failing on the first invalid filter.
pub fn compile_scopes(configs: Vec<WatchConfig>) -> Result<Vec<ScopeSpec>, ConfigError> {
    configs.into_iter().enumerate().map(|(i, c)| ScopeSpec::compile(i, c)).collect()
}

/// Watch callback: tag the change with its eligibility and enqueue it.
pub fn enqueue_handler(queue: WorkQueue<QueueItem>, toggles: WatchEvent) -> impl Fn(ChangeType, String) + Send + 'static {
    move |change, key| queue.add(QueueItem::new(key, change, toggles.enabled(change)))
}

/// Run one scope until `stop` fires.
pub async fn run_scope(client: Client, spec: ScopeSpec, sinks: Arc<SinkSet>, renderer: Arc<Renderer>, workers: usize, stop: CancellationToken) -> Result<()> {
    let queue: WorkQueue<QueueItem> = WorkQueue::new(spec.name.clone());
    let start_time = Utc::now();
    info!(scope = %spec.name, start = %start_time.to_rfc3339(), "starting event controller");

    let watch = spawn_event_watch(
        client,
        spec.config.namespace(),
        field_selector(&spec.config.field_selectors),
        spec.name.clone(),
        enqueue_handler(queue.clone(), spec.config.watch_event),
        stop.child_token(),
    );

    let synced = tokio::select! {
        _ = stop.cancelled() => false,
        r = watch.store.wait_until_ready() => {
            r.with_context(|| format!("cache sync for scope {}", spec.name))?;
            true
        }
    };
    if !synced {
        queue.shut_down();
        let _ = watch.handle.await;
        return Ok(());
    }
    info!(scope = %spec.name, cached = watch.store.state().len(), "cache synced; starting workers");

    let engine = DecisionEngine::new(spec.policy, spec.filter.clone(), start_time);
    let controller = Arc::new(Controller::new(
        spec.name.clone(),
        queue.clone(),
        Arc::new(watch.store.clone()),
        engine,
        renderer,
        sinks.dispatcher_for(&spec.config),
    ));
    let pool: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let c = controller.clone();
            tokio::spawn(async move { c.run_worker().await })
        })
        .collect();

    stop.cancelled().await;
    info!(scope = %spec.name, "stopping event controller");
    queue.shut_down();
    for w in pool {
        if let Err(e) = w.await {
            error!(scope = %spec.name, error = %e, "worker task failed");
        }
    }
    let _ = watch.handle.await;
    Ok(())
}

/// Run every scope concurrently; returns when all have stopped.
pub async fn run_all(client: Client, scopes: Vec<ScopeSpec>, sinks: Arc<SinkSet>, renderer: Arc<Renderer>, workers: usize, stop: CancellationToken) -> Result<()> {
    let tasks = scopes.into_iter().map(|spec| {
        let name = spec.name.clone();
        let fut = run_scope(client.clone(), spec, sinks.clone(), renderer.clone(), workers, stop.clone());
        async move { (name, fut.await) }
    });
    for (name, res) in futures::future::join_all(tasks).await {
        if let Err(e) = res {
            error!(scope = %name, error = %e, "scope stopped with error");
        }
    }
    Ok(())
}
