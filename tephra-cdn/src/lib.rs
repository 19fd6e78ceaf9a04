//! Mirror discovery, verified caching, and resource resolution.
//!
//! Content is fetched through a fixed precedence chain: a locally
//! installed game's storage, the persistent disk cache, and finally a
//! ranked pool of remote mirrors. Every downloaded file is written
//! atomically and, on request, verified against the digest that names
//! it.

pub mod cache;
pub mod cancel;
pub mod casc;
mod error;
pub mod manifest;
pub mod mirrors;
pub mod patch;
pub mod resolver;

pub use cache::{CacheKind, DiskCache};
pub use cancel::{CancelHandle, CancelSignal};
pub use casc::LocalCasc;
pub use error::{Error, Result};
pub use manifest::{CdnEntry, VersionEntry, parse_cdns, parse_versions};
pub use mirrors::{Mirror, MirrorPool};
pub use patch::PatchService;
pub use resolver::{Resolver, Resource};
