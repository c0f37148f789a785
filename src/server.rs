//! Session loop and connection handling.
//!
//! One long-lived session owns one engine handle: accept a connection, read
//! one request, run one (or, after an empty response, two) engine queries
//! with fragments streamed straight back to the client, log the final text,
//! close, accept the next. Per-connection failures never take down the
//! listener loop, and the engine handle stays usable across them.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::chat::collector::ResponseCollector;
use crate::chat::prompt::PromptHandler;
use crate::config::RelayConfig;
use crate::engine::{CancelToken, CompletionMode, DialogEngine, EngineError};

/// Written to the client instead of generated content when a query fails.
const QUERY_FAILED_MSG: &str =
    "Failed to get response from the dialog engine. Please restart the relay.";
/// Written to the client when the pre-retry reset fails.
const RESET_FAILED_MSG: &str = "Failed to reset the dialog engine.";

/// One process-lifetime session: the engine handle plus templater state,
/// reused across every connection.
pub struct ChatServer<E: DialogEngine> {
    engine: E,
    prompt_handler: PromptHandler,
    config: RelayConfig,
}

impl<E: DialogEngine> ChatServer<E> {
    pub fn new(engine: E, prompt_handler: PromptHandler, config: RelayConfig) -> Self {
        Self {
            engine,
            prompt_handler,
            config,
        }
    }

    /// Bind the listener and serve connections, one at a time, until the
    /// process exits. Further clients queue at the transport layer.
    pub fn run(&mut self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)?;
        info!("Socket server listening on {addr}");

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {peer}");
                    self.handle_connection(stream);
                }
                Err(e) => error!("Accept failed: {e}"),
            }
        }
    }

    /// Run one request/response exchange. The stream closes on every exit
    /// path when it drops.
    fn handle_connection(&mut self, mut stream: TcpStream) {
        self.apply_timeouts(&stream);

        // One read is the whole request; no assembly across reads.
        let mut buf = vec![0u8; self.config.read_buffer_size];
        let bytes_received = match stream.read(&mut buf) {
            Ok(0) => {
                debug!("Client closed without sending data");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Request read failed: {e}");
                return;
            }
        };

        let user_prompt = String::from_utf8_lossy(&buf[..bytes_received]).into_owned();
        info!("Received query ({bytes_received} bytes): {user_prompt}");

        let templated = self.prompt_handler.prompt_with_tag(&user_prompt);
        let tagged_prompt = match &self.config.bot_name {
            Some(name) => format!("{name}: {templated}"),
            None => templated,
        };

        let first = match self.query_once(&tagged_prompt, &mut stream) {
            Ok(text) => text,
            Err(e) => {
                error!("Engine query failed: {e}");
                write_reply(&mut stream, QUERY_FAILED_MSG);
                return;
            }
        };

        // An empty successful response is treated as recoverable engine
        // state: reset once and repeat the query with the same templated
        // prompt. Never more than one reset+retry cycle per request.
        let final_response = if first.is_empty() {
            info!("Empty response, resetting dialog state and retrying once");
            if let Err(e) = self.engine.reset() {
                error!("Engine reset failed: {e}");
                write_reply(&mut stream, RESET_FAILED_MSG);
            }
            match self.query_once(&tagged_prompt, &mut stream) {
                Ok(text) => text,
                Err(e) => {
                    error!("Retried engine query failed: {e}");
                    write_reply(&mut stream, QUERY_FAILED_MSG);
                    return;
                }
            }
        } else {
            first
        };

        info!("Generated response: {final_response}");
    }

    /// One engine query with a fresh collector bound to the connection.
    fn query_once(&mut self, prompt: &str, stream: &mut TcpStream) -> Result<String, EngineError> {
        let cancel = self.query_cancel_token();
        let mut collector = ResponseCollector::new(stream);
        self.engine.query(
            prompt,
            CompletionMode::Complete,
            &cancel,
            &mut |text, code| collector.on_fragment(text, code),
        )?;
        if !collector.response().is_empty() && !collector.is_complete() {
            debug!("Query returned without an end-of-turn marker");
        }
        Ok(collector.into_response())
    }

    fn query_cancel_token(&self) -> CancelToken {
        match timeout_from_secs(self.config.query_timeout_secs) {
            Some(deadline) => CancelToken::with_deadline(deadline),
            None => CancelToken::new(),
        }
    }

    fn apply_timeouts(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_read_timeout(timeout_from_secs(self.config.read_timeout_secs)) {
            warn!("Failed to set read timeout: {e}");
        }
        if let Err(e) = stream.set_write_timeout(timeout_from_secs(self.config.write_timeout_secs))
        {
            warn!("Failed to set write timeout: {e}");
        }
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then_some(Duration::from_secs(secs))
}

/// Best-effort write of a fixed error string; the connection is closing
/// anyway, so failures are only logged.
fn write_reply(stream: &mut TcpStream, message: &str) {
    if let Err(e) = stream.write_all(message.as_bytes()) {
        debug!("Failed to write error reply: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::prompt::{builtin_profile, PromptHandler, DEFAULT_SYSTEM_PROMPT};
    use crate::engine::mock::{MockEngine, MockTurn};
    use std::io::{Read as _, Write as _};
    use std::net::Shutdown;
    use std::sync::mpsc;
    use std::thread;

    fn reply(fragments: &[&str]) -> MockTurn {
        MockTurn::Reply(fragments.iter().map(|s| s.to_string()).collect())
    }

    fn test_server(engine: MockEngine) -> ChatServer<MockEngine> {
        let profile = builtin_profile("llama3", DEFAULT_SYSTEM_PROMPT).unwrap();
        let config = RelayConfig {
            query_timeout_secs: 5,
            ..RelayConfig::default()
        };
        ChatServer::new(engine, PromptHandler::new(profile), config)
    }

    /// Drive one full exchange against the server and return the reply bytes
    /// the client read until the server closed the connection.
    fn exchange(server: &mut ChatServer<MockEngine>, request: &[u8]) -> Vec<u8> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let request = request.to_vec();
        let (sent_tx, sent_rx) = mpsc::channel();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            if !request.is_empty() {
                stream.write_all(&request).unwrap();
            }
            stream.shutdown(Shutdown::Write).unwrap();
            sent_tx.send(()).unwrap();
            let mut received = Vec::new();
            // A server that closes with unread request bytes may reset the
            // connection; the bytes read so far are still the reply.
            let _ = stream.read_to_end(&mut received);
            received
        });

        // Accept only after the client has flushed the whole request, so the
        // single server-side read sees it all at once.
        sent_rx.recv().unwrap();
        let (stream, _) = listener.accept().unwrap();
        server.handle_connection(stream);
        client.join().unwrap()
    }

    #[test]
    fn test_round_trip_streams_fragments() {
        let mut server = test_server(MockEngine::scripted(vec![reply(&["Four ", "runs!"])]));
        let received = exchange(&mut server, b"4 runs!");
        assert_eq!(received, b"Four runs!");
        let queries = server.engine.queries();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains("<|begin_of_text|>"));
        assert!(queries[0].contains("4 runs!"));
        assert_eq!(server.engine.reset_calls(), 0);
    }

    #[test]
    fn test_preamble_sent_exactly_once_across_connections() {
        let mut server = test_server(MockEngine::scripted(vec![
            reply(&["first"]),
            reply(&["second"]),
        ]));
        exchange(&mut server, b"one");
        exchange(&mut server, b"two");
        let queries = server.engine.queries();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].contains("<|begin_of_text|>"));
        assert!(!queries[1].contains("<|begin_of_text|>"));
    }

    #[test]
    fn test_empty_response_resets_and_retries_same_prompt() {
        let mut server = test_server(MockEngine::scripted(vec![
            MockTurn::Empty,
            reply(&["recovered"]),
        ]));
        let received = exchange(&mut server, b"howzat");
        assert_eq!(received, b"recovered");
        assert_eq!(server.engine.reset_calls(), 1);
        let queries = server.engine.queries();
        assert_eq!(queries.len(), 2);
        // The retry reuses the first templated prompt; the first-turn flag
        // does not revert.
        assert_eq!(queries[0], queries[1]);
    }

    #[test]
    fn test_empty_retry_is_accepted_as_final() {
        let mut server =
            test_server(MockEngine::scripted(vec![MockTurn::Empty, MockTurn::Empty]));
        let received = exchange(&mut server, b"anything");
        assert_eq!(received, b"");
        assert_eq!(server.engine.reset_calls(), 1);
        assert_eq!(server.engine.queries().len(), 2);
    }

    #[test]
    fn test_query_failure_writes_fixed_error() {
        let mut server = test_server(MockEngine::scripted(vec![MockTurn::Fail(
            "backend gone".to_string(),
        )]));
        let received = exchange(&mut server, b"hello");
        assert_eq!(received, QUERY_FAILED_MSG.as_bytes());
        assert_eq!(server.engine.reset_calls(), 0);
        assert_eq!(server.engine.queries().len(), 1);
    }

    #[test]
    fn test_retried_query_failure_writes_fixed_error() {
        let mut server = test_server(MockEngine::scripted(vec![
            MockTurn::Empty,
            MockTurn::Fail("backend gone".to_string()),
        ]));
        let received = exchange(&mut server, b"hello");
        assert_eq!(received, QUERY_FAILED_MSG.as_bytes());
        assert_eq!(server.engine.reset_calls(), 1);
        assert_eq!(server.engine.queries().len(), 2);
    }

    #[test]
    fn test_reset_failure_reports_but_still_retries() {
        let mut server = test_server(
            MockEngine::scripted(vec![MockTurn::Empty, reply(&["late answer"])]).fail_resets(),
        );
        let received = exchange(&mut server, b"hello");
        let expected = format!("{RESET_FAILED_MSG}late answer");
        assert_eq!(received, expected.as_bytes());
        assert_eq!(server.engine.queries().len(), 2);
    }

    #[test]
    fn test_zero_byte_read_skips_query_and_keeps_serving() {
        let mut server = test_server(MockEngine::scripted(vec![reply(&["ok"])]));
        let received = exchange(&mut server, b"");
        assert_eq!(received, b"");
        assert!(server.engine.queries().is_empty());

        // The first-turn flag was not consumed; the next exchange still
        // carries the preamble.
        let received = exchange(&mut server, b"still here");
        assert_eq!(received, b"ok");
        assert!(server.engine.queries()[0].contains("<|begin_of_text|>"));
    }

    #[test]
    fn test_request_capped_at_read_buffer() {
        let mut server = test_server(MockEngine::scripted(vec![reply(&["ok"])]));
        let body = vec![b'x'; 5000];
        exchange(&mut server, &body);
        let captured = &server.engine.queries()[0];
        let full_buffer: String = "x".repeat(4096);
        assert!(captured.contains(&full_buffer));
        assert!(!captured.contains(&"x".repeat(4097)));
    }

    #[test]
    fn test_bot_name_tags_the_templated_prompt() {
        let profile = builtin_profile("generic", "sys").unwrap();
        let config = RelayConfig {
            bot_name: Some("Qbot".to_string()),
            ..RelayConfig::default()
        };
        let mut server = ChatServer::new(
            MockEngine::scripted(vec![reply(&["ok"])]),
            PromptHandler::new(profile),
            config,
        );
        exchange(&mut server, b"hello");
        assert!(server.engine.queries()[0].starts_with("Qbot: System: sys"));
    }
}
