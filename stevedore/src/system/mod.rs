//! Process-wide context: store locations, configuration defaults and locks.

pub mod context;
pub mod layout;
pub mod lock;

pub use context::{Isolation, SystemContext};
pub use layout::StoreLayout;
pub use lock::FileLock;
