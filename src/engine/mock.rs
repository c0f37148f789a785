// Mock engine implementation, used by tests and as the fallback when no
// engine command is configured.

use std::collections::VecDeque;

use log::debug;

use super::{CancelToken, CompletionMode, DialogEngine, EngineError, SentenceCode};

/// Scripted behavior for one query call.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Stream these fragments in order; the last one carries `End`.
    Reply(Vec<String>),
    /// Invoke the callback zero times and return success.
    Empty,
    /// Fail the query call.
    Fail(String),
}

enum Mode {
    /// Keyword-matched canned replies, streamed word by word.
    Canned,
    /// Per-call scripted turns, consumed front to back.
    Scripted(VecDeque<MockTurn>),
}

pub struct MockEngine {
    mode: Mode,
    queries: Vec<String>,
    reset_calls: usize,
    fail_resets: bool,
}

impl MockEngine {
    /// An engine that answers with canned keyword replies.
    pub fn canned() -> Self {
        Self {
            mode: Mode::Canned,
            queries: Vec::new(),
            reset_calls: 0,
            fail_resets: false,
        }
    }

    /// An engine that plays back `turns`, one per query call. Exhausting the
    /// script behaves like [`MockTurn::Empty`].
    pub fn scripted(turns: Vec<MockTurn>) -> Self {
        Self {
            mode: Mode::Scripted(turns.into()),
            queries: Vec::new(),
            reset_calls: 0,
            fail_resets: false,
        }
    }

    /// Make every reset call fail.
    pub fn fail_resets(mut self) -> Self {
        self.fail_resets = true;
        self
    }

    /// Prompts received so far, in call order.
    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    pub fn reset_calls(&self) -> usize {
        self.reset_calls
    }

    fn canned_reply(prompt: &str) -> &'static str {
        match prompt.to_lowercase().as_str() {
            p if p.contains("hello") || p.contains("hi") => {
                "Hello! I'm the relay's built-in mock engine. How can I help you today?"
            }
            p if p.contains("help") => {
                "I'm a stand-in for a real dialog engine. Configure an engine command to get live generations."
            }
            _ => "This is a mock response. Point the relay at a real engine process for actual generations.",
        }
    }
}

/// Stream `reply` through the callback one word at a time, `End` on the last.
fn stream_words(
    reply: &str,
    cancel: &CancelToken,
    on_fragment: &mut dyn FnMut(&str, SentenceCode),
) -> Result<(), EngineError> {
    let words: Vec<&str> = reply.split_inclusive(' ').collect();
    let count = words.len();
    for (i, word) in words.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let code = if i + 1 == count {
            SentenceCode::End
        } else if i == 0 {
            SentenceCode::Begin
        } else {
            SentenceCode::Continue
        };
        on_fragment(word, code);
    }
    Ok(())
}

impl DialogEngine for MockEngine {
    fn query(
        &mut self,
        prompt: &str,
        _mode: CompletionMode,
        cancel: &CancelToken,
        on_fragment: &mut dyn FnMut(&str, SentenceCode),
    ) -> Result<(), EngineError> {
        self.queries.push(prompt.to_string());
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match &mut self.mode {
            Mode::Canned => stream_words(Self::canned_reply(prompt), cancel, on_fragment),
            Mode::Scripted(turns) => match turns.pop_front() {
                Some(MockTurn::Reply(fragments)) => {
                    let count = fragments.len();
                    for (i, fragment) in fragments.iter().enumerate() {
                        if cancel.is_cancelled() {
                            return Err(EngineError::Cancelled);
                        }
                        let code = if i + 1 == count {
                            SentenceCode::End
                        } else {
                            SentenceCode::Continue
                        };
                        on_fragment(fragment, code);
                    }
                    Ok(())
                }
                Some(MockTurn::Empty) | None => {
                    debug!("[MOCK] Returning success without fragments");
                    Ok(())
                }
                Some(MockTurn::Fail(message)) => Err(EngineError::Engine(message)),
            },
        }
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.reset_calls += 1;
        if self.fail_resets {
            Err(EngineError::Engine("mock reset failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(engine: &mut MockEngine, prompt: &str) -> Result<String, EngineError> {
        let mut out = String::new();
        engine.query(
            prompt,
            CompletionMode::Complete,
            &CancelToken::new(),
            &mut |text, _| out.push_str(text),
        )?;
        Ok(out)
    }

    #[test]
    fn test_canned_reply_reassembles_verbatim() {
        let mut engine = MockEngine::canned();
        let out = collect(&mut engine, "hello there").unwrap();
        assert_eq!(
            out,
            "Hello! I'm the relay's built-in mock engine. How can I help you today?"
        );
    }

    #[test]
    fn test_scripted_turns_play_in_order() {
        let mut engine = MockEngine::scripted(vec![
            MockTurn::Reply(vec!["a".to_string(), "b".to_string()]),
            MockTurn::Empty,
        ]);
        assert_eq!(collect(&mut engine, "one").unwrap(), "ab");
        assert_eq!(collect(&mut engine, "two").unwrap(), "");
        assert_eq!(engine.queries(), ["one", "two"]);
    }

    #[test]
    fn test_cancelled_token_aborts_query() {
        let mut engine = MockEngine::canned();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = engine.query(
            "hi",
            CompletionMode::Complete,
            &cancel,
            &mut |_, _| panic!("no fragments after cancellation"),
        );
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
