//! Build-stamped deployment identity.
//!
//! `release-tool bump` rewrites the two constants below on every deploy;
//! nothing else in the tree may embed the generation or version tag.

use crate::WorkerBlueprint;
use driftwave_core::{Generation, ResourceManifest, VersionTag};

/// Cache generation baked into this build.
pub const CACHE_GENERATION: u64 = 18;

/// Human-readable application version tag for this build.
pub const APP_VERSION: &str = "2026.07.28.2214";

/// The blueprint describing this build's deployment.
pub fn deployed_blueprint(manifest: ResourceManifest) -> WorkerBlueprint {
    WorkerBlueprint {
        version: VersionTag::new(APP_VERSION),
        generation: Generation(CACHE_GENERATION),
        manifest,
    }
}
