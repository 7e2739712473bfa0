//! Daemonless OCI image builder.
//!
//! Stevedore keeps working containers on disk, lets callers edit their
//! configuration, copy content in, run commands inside them under chroot or
//! OCI-runtime isolation, and commit the result as a new image.
//!
//! ```text
//! reference ─► pull ─► Builder ─► run / add / config ─► commit ─► push
//! ```
//!
//! Binaries embedding this crate must call [`reexec::init`] first thing in
//! `main`, so the chroot isolation stages can run from the same executable.

pub mod archive;
pub mod builder;
pub mod cleanup;
pub mod commit;
pub mod idtools;
pub mod image;
pub mod reexec;
pub mod run;
pub mod storage;
pub mod system;
pub mod util;

pub use builder::{Builder, BuilderOptions, BuilderState, CommonBuildOptions};
pub use commit::{CommitOptions, CommitResult};
pub use image::{ImageReference, PullPolicy, Transport};
pub use run::{RunOptions, RunStdio, TerminalPolicy};
pub use stevedore_shared::errors::{ChildStatus, ErrorKind, StevedoreError, StevedoreResult};
pub use storage::{LocalStore, Store};
pub use system::{Isolation, SystemContext};
