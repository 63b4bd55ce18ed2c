//! Host environment for the worker: page registry, notifications, sync
//! scheduling, the event loop feed and the local proxy.

mod clients;
mod event;
mod notifications;
mod registration;
mod server;
mod sync;

pub use clients::ClientRegistry;
pub use event::{EventHandler, HostEvent};
pub use notifications::NotificationCenter;
pub use registration::start_worker;
pub use server::{router, serve, ProxyState};
pub use sync::SyncManager;
