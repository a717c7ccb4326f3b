//! Mirroring pipeline: watcher, sizer, execution engine and coordinator.

mod config;
mod coordinator;
mod executor;
mod position_sizer;
mod retry;
mod watcher;

pub use config::{parse_address_list, parse_decimal_pairs, ExecutionConfig, MirrorConfig, SizingConfig};
pub use coordinator::{MirrorCoordinator, ReconcileReport};
pub use watcher::EventWatcher;
