//! Event catalog for relay instances.
//!
//! Every lifecycle and content notification an instance can emit is one
//! [`EventKind`]. Channel adapters subscribe to a subset; when a caller omits the
//! subset they adopt [`default_events`], the full catalog in declaration order.

pub mod event_catalog;
pub mod event_envelope;

pub use event_catalog::*;
pub use event_envelope::*;
