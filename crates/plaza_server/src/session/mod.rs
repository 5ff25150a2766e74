//! Sessions, the registry that indexes them and the supervisor that ages them.

mod presence;
mod registry;
mod state;
mod supervisor;

pub use presence::PresenceCache;
pub use registry::{BroadcastOutcome, SessionRegistry};
pub use state::Session;
pub use supervisor::{
    SessionNotice, SessionStateChange, SessionSupervisor, SupervisorReport,
};
