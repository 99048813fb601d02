//! Control-plane facade
//!
//! One manager per process owns the active-task set. The control plane
//! (UI or RPC layer) starts, continues, pauses and stops operations per
//! variant, polls progress snapshots, and adjusts the global rate
//! limiter at runtime. Tasks for different variants run concurrently and
//! independently; the limiter is the one resource they share.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hyp_manifest::GameVariant;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    InstallOperation, InstallPhase, InstallPlan, InstallRequest, InstallService, InstallStatus,
    InstallTask, TaskHandle,
};

/// State carried across pause/continue cycles of one task
#[derive(Debug, Default)]
struct SavedState {
    plan: Option<InstallPlan>,
    resume_phase: InstallPhase,
}

#[derive(Debug)]
struct ManagedTask {
    handle: Arc<TaskHandle>,
    operation: InstallOperation,
    running: AtomicBool,
    saved: Mutex<SavedState>,
}

/// Active-task registry and control-plane entry point
#[derive(Debug)]
pub struct InstallManager {
    service: InstallService,
    tasks: DashMap<String, Arc<ManagedTask>>,
}

impl InstallManager {
    /// Create a manager over an install service
    pub fn new(service: InstallService) -> Arc<Self> {
        Arc::new(Self {
            service,
            tasks: DashMap::new(),
        })
    }

    /// Start a new operation or continue a paused one
    ///
    /// A request with a different operation for a variant that already
    /// has a task cancels and replaces that task. Returns the observer
    /// handle; the operation itself runs in the background.
    pub fn start_or_continue(self: &Arc<Self>, mut request: InstallRequest) -> Arc<TaskHandle> {
        let key = request.variant.biz();

        if let Some(existing) = self.tasks.get(&key) {
            if existing.operation != request.operation {
                info!(
                    "operation changed for {key} ({} -> {}), replacing task",
                    existing.operation, request.operation
                );
                existing.handle.cancel();
                drop(existing);
                self.tasks.remove(&key);
            }
        }

        let managed = self
            .tasks
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(ManagedTask {
                    handle: Arc::new(TaskHandle::new(request.variant.clone())),
                    operation: request.operation,
                    running: AtomicBool::new(false),
                    saved: Mutex::new(SavedState::default()),
                })
            })
            .clone();

        if managed.running.swap(true, Ordering::AcqRel) {
            debug!("task for {key} already running");
            return Arc::clone(&managed.handle);
        }

        // Mark siblings that have a running task: the hard-link resolver
        // prefers an in-progress sibling over an idle install
        for sibling in &mut request.siblings {
            sibling.active = self.is_active(&sibling.variant);
        }

        let manager = Arc::clone(self);
        let service = self.service.clone();
        let managed_bg = Arc::clone(&managed);
        tokio::spawn(async move {
            let (saved_plan, saved_phase) = {
                let mut saved = managed_bg.saved.lock();
                (saved.plan.take(), saved.resume_phase)
            };
            let mut task = InstallTask {
                request,
                plan: saved_plan,
                resume_phase: saved_phase,
                handle: Arc::clone(&managed_bg.handle),
            };
            let result = service.run(&mut task).await;

            {
                let mut saved = managed_bg.saved.lock();
                saved.plan = task.plan.take();
                saved.resume_phase = task.resume_phase;
            }
            managed_bg.running.store(false, Ordering::Release);

            // Finished tasks leave the registry; paused and failed ones
            // stay so they can be continued or inspected
            if result.is_ok() {
                manager.tasks.remove(&key);
            }
        });
        Arc::clone(&managed.handle)
    }

    /// Pause a running operation, keeping its resumable state
    pub fn pause(&self, variant: &GameVariant) -> Option<InstallStatus> {
        let managed = self.tasks.get(&variant.biz())?;
        managed.handle.cancel();
        Some(managed.handle.status())
    }

    /// Stop an operation and forget it
    ///
    /// Partial files stay on disk (a future run resumes them); only the
    /// in-memory task state is dropped.
    pub fn stop(&self, variant: &GameVariant) -> Option<InstallStatus> {
        let (_, managed) = self.tasks.remove(&variant.biz())?;
        managed.handle.cancel();
        Some(managed.handle.status())
    }

    /// Current status of a variant's task
    pub fn status(&self, variant: &GameVariant) -> Option<InstallStatus> {
        self.tasks
            .get(&variant.biz())
            .map(|managed| managed.handle.status())
    }

    /// Whether a task is currently running for a variant
    pub fn is_active(&self, variant: &GameVariant) -> bool {
        self.tasks
            .get(&variant.biz())
            .is_some_and(|managed| managed.running.load(Ordering::Acquire))
    }

    /// Adjust the global download rate limit (bytes/sec, 0 = unlimited)
    ///
    /// Shared by every transfer of every running task and effective for
    /// in-flight transfers.
    pub fn set_rate_limit(&self, bytes_per_sec: u64) {
        info!("rate limit set to {bytes_per_sec} bytes/s");
        self.service.limiter().set_rate(bytes_per_sec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyp_manifest::{MetadataClient, Region};
    use hyp_unpack::HpatchTool;

    fn manager() -> Arc<InstallManager> {
        let client = MetadataClient::new("http://127.0.0.1:1/").unwrap();
        let limiter = Arc::new(hyp_download::RateLimiter::unlimited());
        let service = InstallService::new(client, limiter, HpatchTool::from_path()).unwrap();
        InstallManager::new(service)
    }

    #[tokio::test]
    async fn unknown_variant_has_no_status() {
        let manager = manager();
        let variant = GameVariant::new("hk4e", Region::Cn);
        assert!(manager.status(&variant).is_none());
        assert!(manager.pause(&variant).is_none());
        assert!(manager.stop(&variant).is_none());
        assert!(!manager.is_active(&variant));
    }

    #[tokio::test]
    async fn rate_limit_propagates_to_shared_limiter() {
        let manager = manager();
        manager.set_rate_limit(1_048_576);
        assert_eq!(manager.service.limiter().rate(), 1_048_576);
        manager.set_rate_limit(0);
        assert_eq!(manager.service.limiter().rate(), 0);
    }

    #[tokio::test]
    async fn failed_task_remains_inspectable() {
        let manager = manager();
        let variant = GameVariant::new("hk4e", Region::Cn);
        let dir = tempfile::tempdir().unwrap();
        let request = InstallRequest::new(
            variant.clone(),
            dir.path().join("install"),
            crate::InstallOperation::Install,
        );
        let handle = manager.start_or_continue(request);

        // The metadata endpoint is unreachable, so the task must land in
        // the error phase and stay queryable
        for _ in 0..200 {
            if handle.phase() == InstallPhase::Error {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(handle.phase(), InstallPhase::Error);
        let status = manager.status(&variant).unwrap();
        assert!(status.error.is_some());
    }
}
