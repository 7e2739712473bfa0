//! Image formats, references, transports and the copy pipeline.

pub mod config;
pub mod copy;
pub mod lists;
pub mod manifest;
pub mod policy;
pub mod pull;
pub mod reference;
pub mod transports;

pub use config::ImageConfig;
pub use copy::{CopyOptions, CopyReport, copy_image};
pub use lists::{ManifestList, PushSelection};
pub use manifest::{Descriptor, Manifest, ManifestType};
pub use policy::Policy;
pub use pull::{PullOptions, PullPolicy, PulledImage, Puller};
pub use reference::{ImageReference, Transport};
