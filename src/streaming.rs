//! SSE relay between one upstream stream and one downstream client.
//!
//! A producer task owns the upstream body, decodes SSE events and pushes them
//! onto a bounded chunk queue. Upstream transport failures go to a single-slot
//! error channel. The producer closes both channels by dropping them when it
//! exits. The consumer relays chunks in order and stops on the end marker, on
//! upstream close, or when the downstream receiver is gone.

use crate::config::ProviderFamily;
use crate::estimate::estimate_tokens;
use crate::transform::{Usage, extract_stream_text, extract_usage};
use axum::response::sse::Event;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseChunk {
    pub event: String,
    pub id: String,
    pub data: String,
}

impl SseChunk {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }

    fn to_event(&self) -> Event {
        let mut event = Event::default().data(&self.data);
        if !self.event.is_empty() && self.event != "message" {
            event = event.event(&self.event);
        }
        if !self.id.is_empty() {
            event = event.id(&self.id);
        }
        event
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    ClientCancelled,
    UpstreamError,
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClientCancelled => "client_cancelled",
            Self::UpstreamError => "upstream_error",
        }
    }
}

/// Tracks usage across chunks. Some upstreams report per-chunk deltas, others
/// a cumulative value, so both the per-field maximum and the per-field sum are
/// kept; a non-zero maximum is treated as the cumulative figure.
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    max: Usage,
    sum: Usage,
    observed: bool,
}

impl UsageTracker {
    pub fn observe(&mut self, usage: &Usage) {
        self.observed = true;
        self.max.input_tokens = self.max.input_tokens.max(usage.input_tokens);
        self.max.output_tokens = self.max.output_tokens.max(usage.output_tokens);
        self.max.total_tokens = self.max.total_tokens.max(usage.total_tokens);
        self.sum.input_tokens = self.sum.input_tokens.saturating_add(usage.input_tokens);
        self.sum.output_tokens = self.sum.output_tokens.saturating_add(usage.output_tokens);
        self.sum.total_tokens = self.sum.total_tokens.saturating_add(usage.total_tokens);
        if let Some(cost) = usage.cost_used {
            self.max.cost_used = Some(self.max.cost_used.map_or(cost, |c| c.max(cost)));
        }
    }

    pub fn observed(&self) -> bool {
        self.observed
    }

    pub fn finalize(&self) -> Option<Usage> {
        if !self.observed {
            return None;
        }
        let pick = |max: u64, sum: u64| if max > 0 { max } else { sum };
        let input_tokens = pick(self.max.input_tokens, self.sum.input_tokens);
        let output_tokens = pick(self.max.output_tokens, self.sum.output_tokens);
        let reported_total = pick(self.max.total_tokens, self.sum.total_tokens);
        Some(Usage {
            input_tokens,
            output_tokens,
            total_tokens: reported_total.max(input_tokens.saturating_add(output_tokens)),
            cost_used: self.max.cost_used,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub outcome: StreamOutcome,
    pub usage: Usage,
    pub usage_observed: bool,
    pub emitted_text: String,
    pub chunks: u64,
    pub error: Option<String>,
}

/// Spawns the producer. Returns the chunk queue and the error slot.
pub fn spawn_producer<S, B, E>(
    body: S,
    capacity: usize,
) -> (mpsc::Receiver<SseChunk>, mpsc::Receiver<String>)
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (chunk_tx, chunk_rx) = mpsc::channel::<SseChunk>(capacity.max(1));
    let (err_tx, err_rx) = mpsc::channel::<String>(1);
    tokio::spawn(async move {
        let mut events = std::pin::pin!(body.eventsource());
        while let Some(item) = events.next().await {
            match item {
                Ok(ev) => {
                    let chunk = SseChunk {
                        event: ev.event,
                        id: ev.id,
                        data: ev.data,
                    };
                    let done = chunk.is_done();
                    if chunk_tx.send(chunk).await.is_err() {
                        return;
                    }
                    if done {
                        return;
                    }
                }
                Err(EventStreamError::Transport(err)) => {
                    let _ = err_tx.send(err.to_string()).await;
                    return;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "skipping undecodable sse event");
                }
            }
        }
    });
    (chunk_rx, err_rx)
}

/// Relays chunks to `client` until the stream ends or the client goes away.
pub async fn relay(
    family: ProviderFamily,
    estimated_input_tokens: u64,
    mut chunks: mpsc::Receiver<SseChunk>,
    mut errors: mpsc::Receiver<String>,
    client: mpsc::Sender<Event>,
) -> StreamSummary {
    let mut tracker = UsageTracker::default();
    let mut emitted_text = String::new();
    let mut relayed: u64 = 0;
    let mut error = None;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = client.closed() => break StreamOutcome::ClientCancelled,
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else {
                    // producer exited; an error, if any, is already in the slot
                    match errors.try_recv() {
                        Ok(message) => {
                            error = Some(message);
                            let _ = client.send(error_event()).await;
                            break StreamOutcome::UpstreamError;
                        }
                        Err(_) => break StreamOutcome::Completed,
                    }
                };
                if !chunk.is_done() {
                    if let Ok(value) = serde_json::from_str::<Value>(&chunk.data) {
                        if let Some(usage) = extract_usage(family, &value) {
                            tracker.observe(&usage);
                        }
                        if let Some(text) = extract_stream_text(family, &value) {
                            emitted_text.push_str(&text);
                        }
                    }
                }
                if client.send(chunk.to_event()).await.is_err() {
                    break StreamOutcome::ClientCancelled;
                }
                relayed += 1;
                if chunk.is_done() {
                    break StreamOutcome::Completed;
                }
            }
            Some(message) = errors.recv() => {
                error = Some(message);
                let _ = client.send(error_event()).await;
                break StreamOutcome::UpstreamError;
            }
        }
    };

    if let Some(message) = error.as_deref() {
        tracing::warn!(error = %message, chunks = relayed, "upstream stream failed");
    }
    metrics::counter!("relaymeter_stream_outcomes_total", "outcome" => outcome.as_str())
        .increment(1);

    let usage_observed = tracker.observed();
    let usage = tracker.finalize().unwrap_or_else(|| {
        Usage::new(estimated_input_tokens, estimate_tokens(&emitted_text))
    });
    StreamSummary {
        outcome,
        usage,
        usage_observed,
        emitted_text,
        chunks: relayed,
        error,
    }
}

/// The single event sent downstream when the upstream fails.
pub fn error_event() -> Event {
    let payload = json!({
        "error": {
            "message": "upstream stream failed",
            "type": "upstream_error",
            "code": "upstream_error",
        }
    });
    Event::default().event("error").data(payload.to_string())
}
