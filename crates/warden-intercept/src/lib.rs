//! Warden Interception Layer
//!
//! The front door of the pipeline: nothing reaches the network before a
//! decision is rendered.
//!
//! Flow:
//! 1. Name lookups hit the DNS Interceptor first - an explicitly
//!    blocked domain dies here, before any IP exists
//! 2. Connection attempts hit the Flow Interceptor: policy verdicts
//!    resolve synchronously, everything else goes through the lobby
//! 3. Any internal error fails closed (BLOCK), never open

mod dns;
mod interceptor;

pub use dns::{DNS_BLOCKED_REASON, DnsConfig, DnsError, DnsInterceptor, UpstreamResolver};
pub use interceptor::{FlowInterceptor, INTERCEPTOR_FAILURE_REASON, InterceptError};
