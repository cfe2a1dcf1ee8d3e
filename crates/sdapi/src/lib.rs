//! Render backend integration.
//!
//! Talks to Automatic1111-compatible render processes: the REST client
//! ([`api`]), request and response messages ([`messages`]), per-device
//! launch scripts ([`launch`]), startup readiness polling ([`readiness`]),
//! and the per-device process supervisor ([`supervisor`]).

pub mod api;
pub mod launch;
pub mod messages;
pub mod readiness;
pub mod supervisor;
