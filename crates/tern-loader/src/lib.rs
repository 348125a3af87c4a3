//! Tern module resolution and native loading
//!
//! Builds on `tern-archive` to turn bundle overlays into a module search
//! path:
//! - **Resolver**: maps dotted component names to located units (source,
//!   bytecode, native) or namespace candidates, with an explicit ordered
//!   suffix table
//! - **ELF reader**: extracts a binary's declared shared-library
//!   dependencies from its dynamic section
//! - **NativeLoader**: materializes native binaries, pre-loads their
//!   dependency chains, and works around legacy Android linker behavior
//!   (basename conflation, absolute-path dependency resolution)

pub mod elf;
pub mod error;
pub mod native;
pub mod platform;
pub mod resolver;

pub use error::LoadError;
pub use native::{LoadState, NativeConfig, NativeLoader};
pub use platform::{LibHandle, LinkerHost, LinkerProfile, SystemLinker};
pub use resolver::{Loaders, Located, Resolver, UnitKind};
