//! Remote manifest model and metadata client for the game install pipeline
//!
//! Two remote protocols describe a game build:
//!
//! - the legacy **package** protocol: whole archives plus version-keyed
//!   diff archives ([`GamePackage`])
//! - the **chunk** protocol: per-category content-addressed chunk indexes
//!   with raw and deduplicated statistics ([`ChunkBuild`]), plus optional
//!   patch builds carrying binary diffs ([`PatchBuild`])
//!
//! [`MetadataClient`] fetches both shapes from the metadata service along
//! with the per-variant profile, branch tags, the deprecated-file feed and
//! `pkg_version` ground-truth listings. All types are immutable snapshots;
//! callers re-fetch per pipeline run rather than mutating them.
//!
//! # Example
//!
//! ```no_run
//! use hyp_manifest::{GameVariant, MetadataClient, Region};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MetadataClient::new("https://meta.example.com")?;
//! let variant = GameVariant::new("hk4e", Region::Global);
//! let package = client.game_package(&variant).await?;
//! println!("latest: {:?}", package.latest_version());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod chunk;
mod client;
mod error;
mod lang;
mod package;
mod pkg_version;
mod profile;
mod variant;
mod version;

pub use chunk::{
    ChunkBuild, ChunkCategory, ChunkFile, ChunkIndex, ChunkRef, ChunkStats, DeleteTag,
    DiffDownload, IndexFile, PatchBuild, PatchCategory, PatchFile, PatchIndex, PatchSource,
    UrlTemplate,
};
pub use client::MetadataClient;
pub use error::{Error, Result};
pub use lang::AudioLanguages;
pub use package::{GamePackage, PackageArchive, PackageBranch, PackageSet};
pub use pkg_version::{parse_pkg_version, PkgVersionEntry};
pub use profile::{
    BranchInfo, CategoryIgnoreEntry, ChannelSdk, DeprecatedFile, DeprecatedFileConfig,
    DownloadMode, GameBranches, VariantProfile,
};
pub use variant::{GameVariant, Region};
pub use version::GameVersion;
