//! Subprocess-backed dialog engine.
//!
//! Spawns the configured engine command and drives it over JSON Lines: one
//! `Configure` carrying the opaque config blob at startup, then `Query` and
//! `Reset` per exchange. Fragment payloads stream back on stdout and are
//! forwarded to the caller's callback as they arrive. Engine stderr is
//! inherited so its logs land next to ours.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use log::{debug, error, warn};

use super::ipc::{EngineCommand, EnginePayload, EngineRequest, EngineResponse};
use super::{CancelToken, CompletionMode, DialogEngine, EngineError, SentenceCode};
use crate::config::EngineConfig;

pub struct ProcessEngine {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl ProcessEngine {
    /// Spawn the engine process and hand it the configuration blob verbatim.
    pub fn spawn(cfg: &EngineConfig) -> Result<Self, EngineError> {
        let command = cfg
            .command
            .as_deref()
            .ok_or_else(|| EngineError::Startup("no engine command configured".to_string()))?;

        debug!("[ENGINE] Spawning engine process: {command}");

        let mut child = Command::new(command)
            .args(&cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EngineError::Startup(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Startup("engine stdin not available".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Startup("engine stdout not available".to_string()))?;

        let mut engine = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        };

        let id = engine.send(EngineCommand::Configure {
            config: cfg.config.clone(),
        })?;
        let response = engine.read_response()?;
        match response.payload {
            EnginePayload::Ready if response.id == id => Ok(engine),
            EnginePayload::Error { message } => Err(EngineError::Startup(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected response to Configure: {other:?}"
            ))),
        }
    }

    fn send(&mut self, command: EngineCommand) -> Result<u64, EngineError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = EngineRequest { id, command };
        let json = serde_json::to_string(&request)
            .map_err(|e| EngineError::Protocol(format!("serialize: {e}")))?;
        writeln!(self.stdin, "{json}")?;
        self.stdin.flush()?;
        Ok(id)
    }

    fn send_fire_and_forget(&mut self, command: EngineCommand) {
        let request = EngineRequest { id: 0, command };
        if let Ok(json) = serde_json::to_string(&request) {
            let _ = writeln!(self.stdin, "{json}");
            let _ = self.stdin.flush();
        }
    }

    /// Read the next non-empty response line from the engine's stdout.
    fn read_response(&mut self) -> Result<EngineResponse, EngineError> {
        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line)?;
            if n == 0 {
                return Err(EngineError::Protocol(
                    "engine process closed its stdout".to_string(),
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map_err(|e| EngineError::Protocol(format!("bad response line: {e}")));
        }
    }
}

impl DialogEngine for ProcessEngine {
    fn query(
        &mut self,
        prompt: &str,
        mode: CompletionMode,
        cancel: &CancelToken,
        on_fragment: &mut dyn FnMut(&str, SentenceCode),
    ) -> Result<(), EngineError> {
        let id = self.send(EngineCommand::Query {
            prompt: prompt.to_string(),
            mode,
        })?;

        loop {
            // Cancellation is observed between fragments; a read blocked on a
            // silent engine only notices once the next line arrives.
            if cancel.is_cancelled() {
                self.send_fire_and_forget(EngineCommand::Cancel);
                return Err(EngineError::Cancelled);
            }

            let response = self.read_response()?;
            match response.payload {
                EnginePayload::Fragment {
                    text,
                    sentence_code,
                } if response.id == id => on_fragment(&text, sentence_code),
                EnginePayload::Fragment { .. } => {
                    warn!(
                        "[ENGINE] Dropping fragment for stale request id={}",
                        response.id
                    );
                }
                EnginePayload::QueryComplete if response.id == id => return Ok(()),
                EnginePayload::Error { message } => return Err(EngineError::Engine(message)),
                other => {
                    return Err(EngineError::Protocol(format!(
                        "unexpected response to Query: {other:?}"
                    )))
                }
            }
        }
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        let id = self.send(EngineCommand::Reset)?;
        loop {
            let response = self.read_response()?;
            match response.payload {
                EnginePayload::ResetComplete if response.id == id => return Ok(()),
                EnginePayload::Fragment { .. } => {
                    warn!("[ENGINE] Dropping fragment received during reset");
                }
                EnginePayload::Error { message } => return Err(EngineError::Engine(message)),
                other => {
                    return Err(EngineError::Protocol(format!(
                        "unexpected response to Reset: {other:?}"
                    )))
                }
            }
        }
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        // Ask for a graceful shutdown, then reap. Failures are logged only;
        // the relay is exiting regardless.
        self.send_fire_and_forget(EngineCommand::Shutdown);
        let _ = self.child.kill();
        if let Err(e) = self.child.wait() {
            error!("[ENGINE] Failed to reap engine process: {e}");
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    /// A shell stand-in for an engine process: prints a canned Ready plus one
    /// streamed turn, then swallows stdin so relay writes don't fail.
    const FAKE_ENGINE: &str = concat!(
        "printf '%s\\n' ",
        r#"'{"id":1,"payload":{"type":"Ready"}}' "#,
        r#"'{"id":2,"payload":{"type":"Fragment","text":"hi ","sentence_code":"Begin"}}' "#,
        r#"'{"id":2,"payload":{"type":"Fragment","text":"there","sentence_code":"End"}}' "#,
        r#"'{"id":2,"payload":{"type":"QueryComplete"}}'"#,
        "; cat >/dev/null"
    );

    fn fake_engine_config(script: &str) -> EngineConfig {
        EngineConfig {
            command: Some("/bin/sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            config: serde_json::json!({"model": "test"}),
        }
    }

    #[test]
    fn test_spawn_and_query_streams_fragments() {
        let mut engine = ProcessEngine::spawn(&fake_engine_config(FAKE_ENGINE)).unwrap();

        let mut collected = String::new();
        let mut last_code = None;
        engine
            .query(
                "ping",
                CompletionMode::Complete,
                &CancelToken::new(),
                &mut |text, code| {
                    collected.push_str(text);
                    last_code = Some(code);
                },
            )
            .unwrap();

        assert_eq!(collected, "hi there");
        assert_eq!(last_code, Some(SentenceCode::End));
    }

    #[test]
    fn test_spawn_fails_without_command() {
        let cfg = EngineConfig::default();
        assert!(matches!(
            ProcessEngine::spawn(&cfg),
            Err(EngineError::Startup(_))
        ));
    }

    #[test]
    fn test_engine_error_payload_fails_configure() {
        let script = concat!(
            "printf '%s\\n' ",
            r#"'{"id":1,"payload":{"type":"Error","message":"bad config"}}'"#,
            "; cat >/dev/null"
        );
        match ProcessEngine::spawn(&fake_engine_config(script)) {
            Err(EngineError::Startup(message)) => assert_eq!(message, "bad config"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected startup failure"),
        }
    }
}
