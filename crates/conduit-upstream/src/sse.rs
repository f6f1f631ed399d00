//! Incremental server-sent events parsing and usage accounting

use serde_json::Value;

/// Token counts reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportedUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl ReportedUsage {
    fn merge(&mut self, other: Self) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }
}

/// Usage from an OpenAI, Anthropic or Gemini style payload
pub fn extract_usage(value: &Value) -> ReportedUsage {
    let from = |usage: &Value, input: &[&str], output: &[&str]| ReportedUsage {
        input_tokens: input.iter().find_map(|k| usage.get(*k).and_then(Value::as_u64)),
        output_tokens: output.iter().find_map(|k| usage.get(*k).and_then(Value::as_u64)),
    };

    let mut usage = ReportedUsage::default();
    if let Some(u) = value.get("usage").filter(|u| u.is_object()) {
        usage.merge(from(u, &["prompt_tokens", "input_tokens"], &["completion_tokens", "output_tokens"]));
    }
    if let Some(u) = value.pointer("/message/usage") {
        usage.merge(from(u, &["input_tokens"], &["output_tokens"]));
    }
    if let Some(u) = value.get("usageMetadata") {
        usage.merge(from(u, &["promptTokenCount"], &["candidatesTokenCount"]));
    }
    usage
}

/// A single SSE line grew past the configured cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream line exceeds {0} bytes")]
pub struct LineTooLong(pub usize);

/// Running totals for one streamed response
///
/// Bytes are fed as they arrive, in whatever chunking the transport
/// produced. Events are dispatched on blank lines.
#[derive(Debug)]
pub struct SseAccumulator {
    line: Vec<u8>,
    max_line: usize,
    data: Vec<String>,
    reported: ReportedUsage,
    text: String,
    tool_calls: Vec<String>,
    finish_reason: Option<String>,
    error: Option<String>,
    events: u64,
    chunks: u64,
    done: bool,
}

impl Default for SseAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::with_line_limit(usize::MAX)
    }

    /// Accumulator that rejects any line longer than `max_line` bytes
    pub fn with_line_limit(max_line: usize) -> Self {
        Self {
            line: Vec::new(),
            max_line,
            data: Vec::new(),
            reported: ReportedUsage::default(),
            text: String::new(),
            tool_calls: Vec::new(),
            finish_reason: None,
            error: None,
            events: 0,
            chunks: 0,
            done: false,
        }
    }

    /// Feed a raw chunk
    ///
    /// On error the partial line is discarded and the stream should be
    /// abandoned.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), LineTooLong> {
        self.chunks += 1;
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.process_line(&line);
            } else if self.line.len() >= self.max_line {
                self.line = Vec::new();
                return Err(LineTooLong(self.max_line));
            } else {
                self.line.push(byte);
            }
        }
        Ok(())
    }

    /// Flush a trailing event that was not followed by a blank line
    pub fn finish(&mut self) {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.process_line(&line);
        }
        self.dispatch();
    }

    fn process_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.strip_suffix('\r').unwrap_or(&line);

        if line.is_empty() {
            self.dispatch();
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // event names, ids and comments carry nothing we account for
    }

    fn dispatch(&mut self) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();

        if payload.trim() == "[DONE]" {
            self.done = true;
            return;
        }
        self.events += 1;

        let Ok(value) = serde_json::from_str::<Value>(&payload) else {
            return;
        };
        self.reported.merge(extract_usage(&value));
        self.observe(&value);
    }

    fn observe(&mut self, value: &Value) {
        // OpenAI chat completion chunks
        if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(content) = choice.pointer("/delta/content").and_then(Value::as_str) {
                    self.text.push_str(content);
                }
                if let Some(calls) = choice.pointer("/delta/tool_calls").and_then(Value::as_array) {
                    for name in calls.iter().filter_map(|c| c.pointer("/function/name").and_then(Value::as_str)) {
                        self.tool_calls.push(name.to_string());
                    }
                }
                if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                    self.finish_reason = Some(reason.to_string());
                }
            }
        }

        // Anthropic message events
        match value.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                if let Some(block) = value.get("content_block")
                    && block.get("type").and_then(Value::as_str) == Some("tool_use")
                    && let Some(name) = block.get("name").and_then(Value::as_str)
                {
                    self.tool_calls.push(name.to_string());
                }
            }
            Some("content_block_delta") => {
                if let Some(text) = value.pointer("/delta/text").and_then(Value::as_str) {
                    self.text.push_str(text);
                }
            }
            Some("message_delta") => {
                if let Some(reason) = value.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.finish_reason = Some(reason.to_string());
                }
            }
            _ => {}
        }

        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
                .unwrap_or("upstream stream error");
            self.error = Some(message.to_string());
        }
    }

    /// Usage reported by the provider, if any
    pub const fn reported(&self) -> ReportedUsage {
        self.reported
    }

    /// Output tokens: the reported count, else an estimate that is never zero
    pub fn output_tokens(&self) -> (u64, bool) {
        match self.reported.output_tokens {
            Some(tokens) => (tokens, false),
            None => {
                let by_text = u64::try_from(self.text.len()).unwrap_or(u64::MAX).div_ceil(4);
                (self.events.max(self.chunks).max(by_text).max(1), true)
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tool_calls(&self) -> &[String] {
        &self.tool_calls
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Error reported in-band by the provider
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Data events seen, excluding the terminator
    pub const fn events(&self) -> u64 {
        self.events
    }

    pub const fn is_done(&self) -> bool {
        self.done
    }
}
