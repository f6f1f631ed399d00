//! Per-request context shared by every workflow step

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Where a request entered the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Trusted internal service traffic
    Internal,
    /// Tenant traffic arriving through the public API
    External,
}

/// Kind of model work being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Embedding,
    Image,
    Video,
    Audio,
}

impl Capability {
    pub const ALL: [Self; 5] = [Self::Chat, Self::Embedding, Self::Image, Self::Video, Self::Audio];

    /// Parse the wire name of a capability
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|capability| capability.as_str() == raw)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Embedding => "embedding",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    /// Whether responses for this capability may be streamed
    pub const fn supports_streaming(self) -> bool {
        matches!(self, Self::Chat | Self::Audio)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdentity {
    /// Unique id used for idempotency and log correlation
    pub trace_id: String,
    pub channel: Channel,
    pub capability: Capability,
    /// Billed tenant, absent for unmetered internal traffic
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
}

impl RequestIdentity {
    /// Identity with a freshly generated trace id
    pub fn new(channel: Channel, capability: Capability) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            channel,
            capability,
            tenant_id: None,
            user_id: None,
            api_key_id: None,
        }
    }
}

/// Client request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Public model alias requested by the client
    pub model: String,
    /// Raw request body
    pub body: Value,
    /// Whether the client asked for a streamed response
    #[serde(default)]
    pub stream: bool,
}

/// Token and cost totals collected while serving a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAccumulator {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost in micro-units of the billing currency
    pub cost_micros: i64,
    /// Set when token counts were estimated rather than reported
    pub estimated: bool,
}

/// What happened on the wire for the last upstream attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpstreamSummary {
    pub candidate_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub url: Option<String>,
    pub status: Option<u16>,
    pub latency: Option<Duration>,
    /// Attempts beyond the first, across all candidates
    pub retry_count: u32,
}

/// Typed key into the context blackboard
///
/// Keys are namespaced so independent steps cannot collide, and typed so a
/// reader always gets back exactly what the writer stored.
pub struct ContextKey<T> {
    namespace: &'static str,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(namespace: &'static str, name: &'static str) -> Self {
        Self {
            namespace,
            name,
            _marker: PhantomData,
        }
    }

    pub const fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Namespaced key/value scratch space for step outputs
#[derive(Default)]
pub struct Blackboard {
    entries: HashMap<(&'static str, &'static str), Box<dyn Any + Send>>,
}

impl Blackboard {
    /// Store a value, returning the previous one under the same key
    pub fn insert<T: Send + 'static>(&mut self, key: &ContextKey<T>, value: T) -> Option<T> {
        self.entries
            .insert((key.namespace, key.name), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Send + 'static>(&self, key: &ContextKey<T>) -> Option<&T> {
        self.entries
            .get(&(key.namespace, key.name))
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + 'static>(&mut self, key: &ContextKey<T>) -> Option<&mut T> {
        self.entries
            .get_mut(&(key.namespace, key.name))
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Take a value out, typically to hand ownership of a stream to the caller
    pub fn remove<T: Send + 'static>(&mut self, key: &ContextKey<T>) -> Option<T> {
        let entry = self.entries.remove(&(key.namespace, key.name))?;
        entry.downcast::<T>().ok().map(|value| *value)
    }

    pub fn contains<T>(&self, key: &ContextKey<T>) -> bool {
        self.entries.contains_key(&(key.namespace, key.name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.entries.keys().map(|(ns, name)| format!("{ns}.{name}")).collect();
        keys.sort();
        f.debug_struct("Blackboard").field("keys", &keys).finish()
    }
}

/// Mutable state for a single request, owned by the orchestrator
///
/// Steps communicate only through this struct. Once an error is recorded
/// it is never replaced, so the first failure is the one the client sees.
pub struct Context {
    pub identity: RequestIdentity,
    pub request: RequestPayload,
    pub blackboard: Blackboard,
    pub billing: BillingAccumulator,
    pub upstream: UpstreamSummary,
    error: Option<GatewayError>,
    started_at: Instant,
}

impl Context {
    pub fn new(identity: RequestIdentity, request: RequestPayload) -> Self {
        Self {
            identity,
            request,
            blackboard: Blackboard::default(),
            billing: BillingAccumulator::default(),
            upstream: UpstreamSummary::default(),
            error: None,
            started_at: Instant::now(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.identity.trace_id
    }

    /// Record the request's failure. Returns false if one was already set.
    pub fn set_error(&mut self, error: GatewayError) -> bool {
        if self.error.is_some() {
            return false;
        }

        self.error = Some(error);
        true
    }

    pub fn error(&self) -> Option<&GatewayError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn take_error(&mut self) -> Option<GatewayError> {
        self.error.take()
    }

    /// Time since the context was created
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("identity", &self.identity)
            .field("model", &self.request.model)
            .field("stream", &self.request.stream)
            .field("blackboard", &self.blackboard)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    const COUNT: ContextKey<u32> = ContextKey::new("test", "count");
    const LABEL: ContextKey<String> = ContextKey::new("test", "label");
    const OTHER_COUNT: ContextKey<u32> = ContextKey::new("other", "count");

    fn context() -> Context {
        Context::new(
            RequestIdentity::new(Channel::External, Capability::Chat),
            RequestPayload {
                model: "gpt-4o".to_string(),
                body: json!({"messages": []}),
                stream: false,
            },
        )
    }

    #[test]
    fn blackboard_round_trips_typed_values() {
        let mut board = Blackboard::default();
        board.insert(&COUNT, 3);
        board.insert(&LABEL, "primary".to_string());

        assert_eq!(board.get(&COUNT), Some(&3));
        assert_eq!(board.get(&LABEL).map(String::as_str), Some("primary"));
        assert_eq!(board.len(), 2);
    }

    #[test]
    fn namespaces_do_not_collide() {
        let mut board = Blackboard::default();
        board.insert(&COUNT, 1);
        board.insert(&OTHER_COUNT, 2);

        assert_eq!(board.get(&COUNT), Some(&1));
        assert_eq!(board.get(&OTHER_COUNT), Some(&2));
    }

    #[test]
    fn insert_returns_previous_value() {
        let mut board = Blackboard::default();
        assert_eq!(board.insert(&COUNT, 1), None);
        assert_eq!(board.insert(&COUNT, 5), Some(1));

        if let Some(count) = board.get_mut(&COUNT) {
            *count += 1;
        }
        assert_eq!(board.remove(&COUNT), Some(6));
        assert!(!board.contains(&COUNT));
    }

    #[test]
    fn first_error_wins() {
        let mut ctx = context();

        assert!(ctx.set_error(GatewayError::client(ErrorCode::InvalidRequest, "first")));
        assert!(!ctx.set_error(GatewayError::internal("second")));
        assert_eq!(ctx.error().map(|e| e.message.as_str()), Some("first"));
    }

    #[test]
    fn capabilities_parse_from_wire_names() {
        assert_eq!(Capability::parse("chat"), Some(Capability::Chat));
        assert_eq!(Capability::parse("image"), Some(Capability::Image));
        assert_eq!(Capability::parse("Chat"), None);
    }

    #[test]
    fn identity_gets_unique_trace_ids() {
        let a = RequestIdentity::new(Channel::Internal, Capability::Embedding);
        let b = RequestIdentity::new(Channel::Internal, Capability::Embedding);
        assert_ne!(a.trace_id, b.trace_id);
    }
}
