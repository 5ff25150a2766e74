//! Handler contract and the router that dispatches to it.

mod handler;
mod router;

pub use handler::PacketHandler;
pub use router::{DispatchOutcome, PacketRouter};
