//! Prompt templating.
//!
//! Wraps each raw utterance in the active template profile. The first turn of
//! a session carries the system preamble; every later turn only the user
//! wrapper and end-of-turn marker.

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Behavioral text used when the config does not supply its own.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Please keep answers concise and to the point.";

/// One named set of template strings.
///
/// `system_preamble` includes its own role markers; `{system}` inside it is
/// replaced with the configured behavioral text at lookup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateProfile {
    /// System/context preamble, emitted on the first turn only.
    pub system_preamble: String,
    /// Wrapper opening the user turn on the first prompt.
    #[serde(default)]
    pub first_user_wrapper: String,
    /// Wrapper opening the user turn on every later prompt.
    pub user_wrapper: String,
    /// End-of-turn marker appended to every prompt.
    pub end_marker: String,
}

lazy_static! {
    // Wrapper texts follow the upstream model cards (Llama 2/3, ChatML).
    static ref BUILTIN_PROFILES: HashMap<&'static str, TemplateProfile> = {
        let mut profiles = HashMap::new();
        profiles.insert(
            "llama3",
            TemplateProfile {
                system_preamble:
                    "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{system}<|eot_id|>\n\n"
                        .to_string(),
                first_user_wrapper: "<|start_header_id|>user<|end_header_id|>\n\n".to_string(),
                user_wrapper: "<|start_header_id|>user<|end_header_id|>\n\n".to_string(),
                end_marker: "<|eot_id|>".to_string(),
            },
        );
        profiles.insert(
            "llama2",
            TemplateProfile {
                // Llama 2 folds the first user turn into the [INST] block that
                // opens with the system text, so no first wrapper.
                system_preamble: "[INST] <<SYS>>\n{system}\n<</SYS>>\n\n".to_string(),
                first_user_wrapper: String::new(),
                user_wrapper: "[INST] ".to_string(),
                end_marker: " [/INST] ".to_string(),
            },
        );
        profiles.insert(
            "chatml",
            TemplateProfile {
                system_preamble: "<|im_start|>system\n{system}<|im_end|>\n".to_string(),
                first_user_wrapper: "<|im_start|>user\n".to_string(),
                user_wrapper: "<|im_start|>user\n".to_string(),
                end_marker: "<|im_end|>\n<|im_start|>assistant\n".to_string(),
            },
        );
        profiles.insert(
            "generic",
            TemplateProfile {
                system_preamble: "System: {system}\n\n".to_string(),
                first_user_wrapper: "User: ".to_string(),
                user_wrapper: "User: ".to_string(),
                end_marker: "\n\nAssistant: ".to_string(),
            },
        );
        profiles
    };
}

/// Look up a built-in profile by id, substituting `system_prompt` into the
/// preamble. Returns `None` for unknown ids.
pub fn builtin_profile(id: &str, system_prompt: &str) -> Option<TemplateProfile> {
    BUILTIN_PROFILES.get(id).map(|profile| TemplateProfile {
        system_preamble: profile.system_preamble.replace("{system}", system_prompt),
        ..profile.clone()
    })
}

/// Built-in profile ids, for config validation messages.
pub fn builtin_profile_ids() -> Vec<&'static str> {
    let mut ids: Vec<&'static str> = BUILTIN_PROFILES.keys().copied().collect();
    ids.sort_unstable();
    ids
}

/// Stateful prompt templater. One instance lives for the whole session.
pub struct PromptHandler {
    profile: TemplateProfile,
    is_first_prompt: bool,
}

impl PromptHandler {
    pub fn new(profile: TemplateProfile) -> Self {
        Self {
            profile,
            is_first_prompt: true,
        }
    }

    /// Wrap a raw utterance in the active template.
    ///
    /// The first call emits the system preamble and flips the first-turn flag
    /// as a side effect; the flag never reverts for the handler's lifetime.
    /// Pure string composition, no failure modes.
    pub fn prompt_with_tag(&mut self, user_prompt: &str) -> String {
        if self.is_first_prompt {
            self.is_first_prompt = false;
            format!(
                "{}{}{}{}",
                self.profile.system_preamble,
                self.profile.first_user_wrapper,
                user_prompt,
                self.profile.end_marker
            )
        } else {
            format!(
                "{}{}{}",
                self.profile.user_wrapper, user_prompt, self.profile.end_marker
            )
        }
    }

    pub fn is_first_prompt(&self) -> bool {
        self.is_first_prompt
    }
}
