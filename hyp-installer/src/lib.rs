//! Install pipeline: planning, hard-link resolution and the resumable
//! state machine
//!
//! This crate turns a remote manifest into a verified, patched, playable
//! install on disk:
//!
//! - [`InstalledBuild`] re-reads the local version and audio markers at
//!   the start of every run
//! - [`Planner`] reconciles the two remote protocol families into one
//!   normalized [`InstallPlan`]
//! - [`resolve_link_root`] redirects the plan at byte-identical sibling
//!   installs on the same volume
//! - [`InstallService`] drives `Prepare → Download → Verify → Decompress
//!   → Merge → Finish` with pause/resume and cancellation
//! - [`InstallManager`] is the control-plane surface: start, continue,
//!   pause, stop, progress snapshots and the runtime rate-limit knob
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hyp_download::RateLimiter;
//! use hyp_installer::{
//!     InstallManager, InstallOperation, InstallRequest, InstallService,
//! };
//! use hyp_manifest::{GameVariant, MetadataClient, Region};
//! use hyp_unpack::HpatchTool;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MetadataClient::new("https://meta.example.com")?;
//! let limiter = Arc::new(RateLimiter::unlimited());
//! let service = InstallService::new(client, limiter, HpatchTool::from_path())?;
//! let manager = InstallManager::new(service);
//!
//! let variant = GameVariant::new("hk4e", Region::Global);
//! let handle = manager.start_or_continue(InstallRequest::new(
//!     variant,
//!     "/games/title",
//!     InstallOperation::Update,
//! ));
//! println!("phase: {}", handle.phase());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod build;
mod error;
mod hardlink;
mod manager;
mod plan;
mod service;
mod state;

pub use build::{
    read_audio_marker, read_category_ignores, write_audio_marker, ConfigMarker, InstalledBuild,
    CONFIG_MARKER,
};
pub use error::{Error, Result};
pub use hardlink::{probe_hard_link_support, resolve_link_root, same_volume};
pub use manager::InstallManager;
pub use plan::{
    ArchiveGroup, InstallPlan, PatchMergeOp, PlanMode, Planner, CHUNK_CACHE_DIR, LDIFF_DIR,
};
pub use service::InstallService;
pub use state::{
    InstallOperation, InstallPhase, InstallRequest, InstallStatus, InstallTask, SiblingInstall,
    TaskHandle,
};
