//! Production implementations of traits

mod channel_broadcaster;
mod notify_watcher;
mod route_table;

pub use channel_broadcaster::ChannelBroadcaster;
pub use notify_watcher::{NotifyWatchHandle, NotifyWatcher};
pub use route_table::StaticRouteTable;
