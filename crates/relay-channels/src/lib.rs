//! Delivery channels for relay instances.
//!
//! A channel adapter pairs one [`ChannelConfig`] (enable flag, event filter,
//! destination) with an injected [`ChannelTransport`]. Adapters deliver through
//! a bounded queue drained by their own worker, so [`ChannelFanout::emit`] only
//! enqueues and one slow sink never delays its siblings. Delivery failures are
//! logged by the worker and never reach the caller.

pub mod channel_adapter;
pub mod channel_config;
pub mod channel_fanout;
pub mod channel_request;
pub mod webhook_transport;

pub use channel_adapter::*;
pub use channel_config::*;
pub use channel_fanout::*;
pub use channel_request::*;
pub use webhook_transport::*;
