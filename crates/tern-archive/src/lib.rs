//! Tern bundle archives
//!
//! Application code for the Tern runtime ships inside read-only, compressed
//! bundles packed into the installed app. This crate provides the pieces that
//! make those bundles usable as a module root:
//! - **ZipIndex**: a directory index over one bundle (listing, reads, metadata)
//! - **Overlay**: several bundles merged into one logical root with
//!   first-match reads and union listings
//! - **Extraction cache**: on-demand materialization of bundle entries into a
//!   local writable root, with change detection and atomic writes
//! - **VersionStore**: per-bundle version tokens that invalidate the whole
//!   extraction root when a bundle changes across app upgrades

pub mod cache;
pub mod error;
pub mod index;
pub mod overlay;
pub mod store;

pub use error::ArchiveError;
pub use index::{ByteSource, EntryMeta, ZipIndex};
pub use overlay::{BundleSource, Overlay};
pub use store::{StoreError, VersionStore};
