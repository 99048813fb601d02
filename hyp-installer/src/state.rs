//! Install task state
//!
//! One [`InstallTask`] exists per running operation and is owned
//! exclusively by the state machine driving it; every phase takes the
//! task and mutates it through that single owner. Observers (the control
//! plane) see a [`TaskHandle`]: an atomically updated phase mirror,
//! shared progress counters and the cancellation source.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use hyp_download::{ProgressSnapshot, TransferProgress};
use hyp_manifest::{AudioLanguages, GameVariant, GameVersion};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::plan::InstallPlan;
use crate::Error;

/// Kind of operation requested by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallOperation {
    /// Fresh install (or forced reinstall)
    Install,
    /// Update an existing build to the released version
    Update,
    /// Re-validate and fix an existing build against ground truth
    Repair,
    /// Fetch an upcoming version's payload without switching to it
    Predownload,
}

impl fmt::Display for InstallOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Repair => "repair",
            Self::Predownload => "predownload",
        };
        f.write_str(name)
    }
}

impl FromStr for InstallOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "update" => Ok(Self::Update),
            "repair" => Ok(Self::Repair),
            "predownload" => Ok(Self::Predownload),
            other => Err(Error::invalid_request(format!("unknown operation {other:?}"))),
        }
    }
}

/// Phase of the install state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum InstallPhase {
    /// No run in progress (initial state, and the state after
    /// cancellation)
    #[default]
    None = 0,
    /// Fetching manifests and planning
    Prepare = 1,
    /// Transferring bytes
    Download = 2,
    /// Checking artifacts against declared checksums
    Verify = 3,
    /// Extracting archives
    Decompress = 4,
    /// Applying binary diffs
    Merge = 5,
    /// Terminal success
    Finish = 6,
    /// Terminal failure
    Error = 7,
}

impl InstallPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Prepare,
            2 => Self::Download,
            3 => Self::Verify,
            4 => Self::Decompress,
            5 => Self::Merge,
            6 => Self::Finish,
            7 => Self::Error,
            _ => Self::None,
        }
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Prepare => "prepare",
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Decompress => "decompress",
            Self::Merge => "merge",
            Self::Finish => "finish",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// A sibling install of the same title considered for hard linking
#[derive(Debug, Clone)]
pub struct SiblingInstall {
    /// The sibling's variant identity
    pub variant: GameVariant,
    /// The sibling's install root
    pub install_path: PathBuf,
    /// Locally detected version, if any
    pub version: Option<GameVersion>,
    /// Whether an install task is currently running for the sibling
    pub active: bool,
}

/// Control-plane request to start or continue an operation
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Variant to operate on
    pub variant: GameVariant,
    /// Install root
    pub install_path: PathBuf,
    /// Requested audio languages; `NONE` keeps the current selection
    pub audio: AudioLanguages,
    /// Operation kind
    pub operation: InstallOperation,
    /// Whether cross-variant hard linking may be used
    pub hard_link_enabled: bool,
    /// Promote downloads without checksum verification
    ///
    /// The only path through which corruption can reach the install;
    /// exposed for constrained environments and surfaced as such.
    pub skip_verify: bool,
    /// Sibling installs of the same title, for the hard-link resolver
    pub siblings: Vec<SiblingInstall>,
}

impl InstallRequest {
    /// Create a request with defaults for the optional knobs
    pub fn new(
        variant: GameVariant,
        install_path: impl Into<PathBuf>,
        operation: InstallOperation,
    ) -> Self {
        Self {
            variant,
            install_path: install_path.into(),
            audio: AudioLanguages::NONE,
            operation,
            hard_link_enabled: false,
            skip_verify: false,
            siblings: Vec::new(),
        }
    }
}

/// Observer-visible state of one task
#[derive(Debug)]
pub struct TaskHandle {
    variant: GameVariant,
    phase: AtomicU8,
    error: Mutex<Option<String>>,
    /// Byte counters of the transfer-like phases
    pub download: Arc<TransferProgress>,
    /// Byte/entry counters of the decompress and merge phases
    pub content: Arc<TransferProgress>,
    cancel: Mutex<CancellationToken>,
}

impl TaskHandle {
    /// Create a handle in the `None` phase
    pub fn new(variant: GameVariant) -> Self {
        Self {
            variant,
            phase: AtomicU8::new(InstallPhase::None as u8),
            error: Mutex::new(None),
            download: Arc::new(TransferProgress::new()),
            content: Arc::new(TransferProgress::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Variant this task operates on
    pub fn variant(&self) -> &GameVariant {
        &self.variant
    }

    /// Current phase
    pub fn phase(&self) -> InstallPhase {
        InstallPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Update the phase mirror
    pub fn set_phase(&self, phase: InstallPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Record a terminal error message
    pub fn set_error(&self, message: Option<String>) {
        *self.error.lock() = message;
    }

    /// The current cancellation token
    ///
    /// A fresh token is issued if the previous run consumed the old one,
    /// so a continued task can be cancelled again.
    pub fn cancellation_token(&self) -> CancellationToken {
        let mut guard = self.cancel.lock();
        if guard.is_cancelled() {
            *guard = CancellationToken::new();
        }
        guard.clone()
    }

    /// Cancel the running operation cooperatively
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Point-in-time status for the control plane
    pub fn status(&self) -> InstallStatus {
        InstallStatus {
            phase: self.phase(),
            error: self.error.lock().clone(),
            download: self.download.snapshot(),
            content: self.content.snapshot(),
        }
    }
}

/// Snapshot streamed back to the control plane
#[derive(Debug, Clone, PartialEq)]
pub struct InstallStatus {
    /// Current phase
    pub phase: InstallPhase,
    /// Terminal error message, when phase is `Error`
    pub error: Option<String>,
    /// Transfer progress
    pub download: ProgressSnapshot,
    /// Decompress/merge progress
    pub content: ProgressSnapshot,
}

/// The state-machine-owned task value
///
/// Mutated in place by every phase; never shared. The persistent pieces
/// (plan, resume phase) survive a pause so that continuing a task stopped
/// in `Download` can skip `Prepare` and reuse the task list.
#[derive(Debug)]
pub struct InstallTask {
    /// The request that created this task
    pub request: InstallRequest,
    /// Plan produced by `Prepare`, reused on download resume
    pub plan: Option<InstallPlan>,
    /// Phase the previous run was cancelled in, for the resume rule
    pub resume_phase: InstallPhase,
    /// Observer handle
    pub handle: Arc<TaskHandle>,
}

impl InstallTask {
    /// Create a fresh task for a request
    pub fn new(request: InstallRequest) -> Self {
        let handle = Arc::new(TaskHandle::new(request.variant.clone()));
        Self {
            request,
            plan: None,
            resume_phase: InstallPhase::None,
            handle,
        }
    }

    /// Whether `Prepare` can be skipped: the previous run was cancelled
    /// mid-download and the task list is still in hand
    pub fn can_resume_download(&self) -> bool {
        self.resume_phase == InstallPhase::Download && self.plan.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyp_manifest::Region;

    #[test]
    fn operation_parsing() {
        assert_eq!(
            "update".parse::<InstallOperation>().unwrap(),
            InstallOperation::Update
        );
        assert!("defragment".parse::<InstallOperation>().is_err());
    }

    #[test]
    fn phase_round_trips_through_atomic() {
        let handle = TaskHandle::new(GameVariant::new("hk4e", Region::Cn));
        assert_eq!(handle.phase(), InstallPhase::None);
        handle.set_phase(InstallPhase::Merge);
        assert_eq!(handle.phase(), InstallPhase::Merge);
    }

    #[test]
    fn cancellation_token_is_reissued_after_cancel() {
        let handle = TaskHandle::new(GameVariant::new("hk4e", Region::Cn));
        let first = handle.cancellation_token();
        handle.cancel();
        assert!(first.is_cancelled());
        let second = handle.cancellation_token();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn resume_rule_requires_download_phase_and_plan() {
        let request = InstallRequest::new(
            GameVariant::new("hk4e", Region::Cn),
            "/tmp/x",
            InstallOperation::Update,
        );
        let mut task = InstallTask::new(request);
        assert!(!task.can_resume_download());
        task.resume_phase = InstallPhase::Download;
        // Still no plan in hand
        assert!(!task.can_resume_download());
    }
}
