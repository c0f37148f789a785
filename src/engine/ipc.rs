//! Wire protocol for the engine subprocess.
//!
//! JSON Lines (one JSON object per line) over the child's stdin/stdout.

use serde::{Deserialize, Serialize};

use super::{CompletionMode, SentenceCode};

/// Request sent to the engine process via stdin.
#[derive(Serialize, Deserialize, Debug)]
pub struct EngineRequest {
    /// Monotonic request ID for correlating responses. 0 = fire-and-forget.
    pub id: u64,
    pub command: EngineCommand,
}

/// Commands the relay can send to the engine process.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum EngineCommand {
    /// Hand the engine its opaque configuration blob. Sent once after spawn.
    Configure { config: serde_json::Value },
    /// Run one generation turn.
    Query { prompt: String, mode: CompletionMode },
    /// Clear dialog state.
    Reset,
    /// Abort the in-flight query.
    Cancel,
    /// Graceful shutdown.
    Shutdown,
}

/// Response from the engine process via stdout.
#[derive(Serialize, Deserialize, Debug)]
pub struct EngineResponse {
    /// Matches the request ID. 0 for unsolicited messages.
    pub id: u64,
    pub payload: EnginePayload,
}

/// Response payloads from the engine process.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum EnginePayload {
    /// Configuration accepted, engine ready for queries.
    Ready,
    /// One streamed fragment of generated text.
    Fragment {
        text: String,
        sentence_code: SentenceCode,
    },
    /// The query call finished.
    QueryComplete,
    /// Dialog state cleared.
    ResetComplete,
    /// The engine failed to honor the request.
    Error { message: String },
}
