//! Trait definitions for dependency injection
//!
//! Everything the engine talks to outside its own process state (the OS watch
//! facility, the HTTP static mount, the replicated-state transport and the
//! client authorization layer) sits behind one of these traits.

mod authorizer;
mod broadcaster;
mod mount;
mod watcher;

pub use authorizer::Authorizer;
pub use broadcaster::{BroadcastError, Broadcaster};
pub use mount::{MountError, MountHandle, MountRegistrar};
pub use watcher::{
    RawEvent, RawEventKind, SignalSender, WatchError, WatchHandle, WatchOptions, WatchPrimitive,
    WatchSignal,
};

#[cfg(test)]
pub use broadcaster::MockBroadcaster;
#[cfg(test)]
pub use mount::MockMountRegistrar;
#[cfg(test)]
pub use watcher::MockWatchPrimitive;
