mod core;
mod events;

pub use self::core::PresenceServer;
pub use self::events::{NoopObserver, SessionObserver};
