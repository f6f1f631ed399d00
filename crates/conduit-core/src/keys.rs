//! Well-known blackboard keys shared between steps

use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::candidate::{Candidate, Pricing};
use crate::context::ContextKey;

/// Response body stream handed to the client
///
/// Errors are delivered in-band as SSE error frames, so items are plain bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Request body rendered for a specific candidate
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedBody {
    pub candidate_id: String,
    pub body: Value,
}

/// Buffered upstream response
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Value,
}

/// Pending charge opened before a streamed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCharge {
    pub trace_id: String,
    pub tenant_id: String,
    pub pricing: Pricing,
}

/// Ranked candidates, best first
pub const ROUTING_CANDIDATES: ContextKey<Vec<Candidate>> = ContextKey::new("routing", "candidates");

/// Index of the candidate currently being tried
pub const ROUTING_INDEX: ContextKey<usize> = ContextKey::new("routing", "index");

/// Affinity hash of the request prefix
pub const ROUTING_AFFINITY_KEY: ContextKey<String> = ContextKey::new("routing", "affinity_key");

pub const RENDERED_BODY: ContextKey<RenderedBody> = ContextKey::new("template", "body");

pub const UPSTREAM_RESPONSE: ContextKey<UpstreamResponse> = ContextKey::new("upstream", "response");

pub const UPSTREAM_STREAM: ContextKey<ByteStream> = ContextKey::new("upstream", "stream");

pub const BILLING_PENDING: ContextKey<PendingCharge> = ContextKey::new("billing", "pending");

/// Candidate currently selected by routing
pub fn current_candidate(ctx: &crate::context::Context) -> Option<&Candidate> {
    let index = ctx.blackboard.get(&ROUTING_INDEX).copied().unwrap_or(0);
    ctx.blackboard.get(&ROUTING_CANDIDATES)?.get(index)
}
