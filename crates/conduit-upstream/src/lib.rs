//! Upstream call step and the machinery around it
//!
//! [`UpstreamCallStep`] sends the rendered request to the current candidate
//! through [`SafeClient`], which enforces the [`UrlPolicy`] on every redirect
//! hop and fails over through proxies. A shared [`CircuitBreaker`] guards each
//! host and credential pair. Streamed responses are metered by
//! [`meter_stream`], which settles usage through a [`StreamCompletionHook`].

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod affinity;
mod circuit;
mod client;
mod error;
pub mod poll;
mod policy;
mod proxy;
pub mod sse;
mod step;
mod stream;

pub use affinity::AffinityTracker;
pub use circuit::{CircuitBreaker, CircuitState};
pub use client::{OutboundRequest, SafeClient};
pub use error::UpstreamError;
pub use policy::{UrlPolicy, is_internal};
pub use proxy::{ProxyPool, StaticProxyPool};
pub use step::{UPSTREAM_ATTEMPTS, UpstreamCallStep, estimate_tokens};
pub use stream::{
    CancelRegistry, CancelWatch, CompletionContext, StreamCompletionHook, StreamLimits, StreamOutcome, StreamUsage,
    error_frame, meter_stream,
};
