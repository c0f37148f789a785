//! Streaming response accumulation.

use std::io::Write;

use log::{debug, warn};

use crate::engine::SentenceCode;

/// Accumulates engine fragments for one query call while mirroring each one
/// to the connection as it arrives.
///
/// Fragments are appended verbatim — no trimming, no deduplication; empty and
/// repeated fragments are kept as-is. Sink write failures do not stop
/// accumulation: the final text is still collected and logged server-side.
pub struct ResponseCollector<'a> {
    sink: &'a mut dyn Write,
    accumulated: String,
    turn_complete: bool,
    write_warned: bool,
}

impl<'a> ResponseCollector<'a> {
    pub fn new(sink: &'a mut dyn Write) -> Self {
        Self {
            sink,
            accumulated: String::new(),
            turn_complete: false,
            write_warned: false,
        }
    }

    /// Engine callback body: append, mirror to the sink, record end-of-turn.
    pub fn on_fragment(&mut self, fragment: &str, code: SentenceCode) {
        self.accumulated.push_str(fragment);
        debug!("[COLLECT] Fragment ({code:?}): {fragment:?}");

        let written = self
            .sink
            .write_all(fragment.as_bytes())
            .and_then(|()| self.sink.flush());
        if let Err(e) = written {
            if !self.write_warned {
                warn!("[COLLECT] Failed to write fragment to client: {e}");
                self.write_warned = true;
            }
        }

        if code == SentenceCode::End {
            self.turn_complete = true;
        }
    }

    /// Whether the engine signalled end-of-turn for this query call.
    pub fn is_complete(&self) -> bool {
        self.turn_complete
    }

    pub fn response(&self) -> &str {
        &self.accumulated
    }

    pub fn into_response(self) -> String {
        self.accumulated
    }
}
