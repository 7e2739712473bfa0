//! Tar layer handling: apply (unpack with whiteouts), diff (detect changes
//! and export them as a layer) and compression.

pub mod apply;
pub mod compression;
pub mod diff;

pub use apply::{ApplyOptions, ApplyStats, apply_layer, apply_layer_file};
pub use compression::{CompressWriter, Compression, decompressed_reader};
pub use diff::{Change, ChangeKind, changes, tar_directory, write_layer};
