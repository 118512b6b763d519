//! Process-signal cleanup shared across orchestrator instances.
//!
//! Registration is refcounted: the first live orchestrator spawns a single
//! termination listener, the last one to deregister tears it down. On
//! SIGINT/SIGTERM every live instance is shut down before the process exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::engine::Orchestrator;

static REGISTRY: Lazy<Mutex<CleanupRegistry>> =
    Lazy::new(|| Mutex::new(CleanupRegistry::default()));
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct CleanupRegistry {
    instances: Vec<(u64, Weak<Orchestrator>)>,
    listener: Option<JoinHandle<()>>,
}

/// Register a live orchestrator. Must be called from within a Tokio runtime.
pub(crate) fn register(orchestrator: &Arc<Orchestrator>) -> u64 {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let mut registry = REGISTRY.lock();
    registry
        .instances
        .push((id, Arc::downgrade(orchestrator)));
    if registry.listener.is_none() {
        registry.listener = Some(tokio::spawn(signal_listener()));
        debug!("termination listener installed");
    }
    id
}

pub(crate) fn deregister(id: u64) {
    let mut registry = REGISTRY.lock();
    registry.instances.retain(|(entry_id, _)| *entry_id != id);
    if registry.instances.is_empty() {
        if let Some(listener) = registry.listener.take() {
            listener.abort();
            debug!("termination listener removed");
        }
    }
}

async fn signal_listener() {
    wait_for_termination().await;
    warn!("termination signal received, shutting down task orchestrators");

    let instances: Vec<Weak<Orchestrator>> = REGISTRY
        .lock()
        .instances
        .iter()
        .map(|(_, weak)| weak.clone())
        .collect();
    for weak in instances {
        if let Some(orchestrator) = weak.upgrade() {
            orchestrator.shutdown();
        }
    }
    std::process::exit(0);
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(error) => {
            warn!(error = %error, "SIGTERM handler unavailable, listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
