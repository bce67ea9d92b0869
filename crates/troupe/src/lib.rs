//! Inter-process coms for orchestrated applications.
//!
//! troupe lets worker applications launched by an orchestration server
//! discover each other and exchange data: publish/subscribe streams with a
//! subscriber barrier, identity-addressed request/reply channels, and the
//! cancellation machinery that unblocks blocking receives.
//!
//! # Crate Structure
//!
//! - [`transport`] — TCP endpoints and leased-port binding
//! - [`wire`] — Multipart framing and typed message envelopes
//! - [`coms`] — Channels, cancellation and the process context

/// Re-export transport types.
pub mod transport {
    pub use troupe_transport::*;
}

/// Re-export wire types.
pub mod wire {
    pub use troupe_wire::*;
}

/// Re-export channel types.
pub mod coms {
    pub use troupe_coms::*;
}
