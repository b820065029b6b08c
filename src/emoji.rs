//! Process-wide emoji registry.
//!
//! Normalized emoji names map to a cached value object per name, so callers
//! can compare by identity rather than string equality. A `sync`-backed
//! singleton table stands in for the JS-side "one object per name" trick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Clone)]
pub struct Emoji(Arc<str>);

impl Emoji {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Emoji {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Emoji {}

impl std::hash::Hash for Emoji {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl std::fmt::Debug for Emoji {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Emoji({})", self.0)
    }
}

struct Inner {
    by_name: Mutex<HashMap<String, Emoji>>,
    slack_to_name: Mutex<HashMap<String, String>>,
    name_to_slack: Mutex<HashMap<String, String>>,
    gchat_to_name: Mutex<HashMap<String, String>>,
    name_to_gchat: Mutex<HashMap<String, String>>,
}

pub struct EmojiRegistry(Inner);

static REGISTRY: OnceLock<EmojiRegistry> = OnceLock::new();

/// The single process-wide registry.
pub fn registry() -> &'static EmojiRegistry {
    REGISTRY.get_or_init(EmojiRegistry::with_defaults)
}

impl EmojiRegistry {
    fn with_defaults() -> Self {
        let registry = EmojiRegistry(Inner {
            by_name: Mutex::new(HashMap::new()),
            slack_to_name: Mutex::new(HashMap::new()),
            name_to_slack: Mutex::new(HashMap::new()),
            gchat_to_name: Mutex::new(HashMap::new()),
            name_to_gchat: Mutex::new(HashMap::new()),
        });
        for (name, slack, gchat) in [
            ("thumbsup", "+1", "thumb_up"),
            ("thumbsdown", "-1", "thumb_down"),
            ("heart", "heart", "heart"),
            ("eyes", "eyes", "eyes"),
            ("tada", "tada", "tada"),
            ("white_check_mark", "white_check_mark", "check_mark"),
            ("x", "x", "cross_mark"),
            ("rocket", "rocket", "rocket"),
            ("laughing", "laughing", "grinning_face_with_smiling_eyes"),
        ] {
            registry.extend(name, Some(slack), Some(gchat));
        }
        registry
    }

    fn normalized(&self, name: &str) -> Emoji {
        let mut by_name = self.0.by_name.lock().unwrap();
        by_name
            .entry(name.to_string())
            .or_insert_with(|| Emoji(Arc::from(name)))
            .clone()
    }

    /// Register (or extend) a normalized name with its platform aliases.
    pub fn extend(&self, normalized: &str, slack: Option<&str>, gchat: Option<&str>) -> Emoji {
        let emoji = self.normalized(normalized);
        if let Some(slack) = slack {
            self.0
                .slack_to_name
                .lock()
                .unwrap()
                .insert(slack.to_string(), normalized.to_string());
            self.0
                .name_to_slack
                .lock()
                .unwrap()
                .insert(normalized.to_string(), slack.to_string());
        }
        if let Some(gchat) = gchat {
            self.0
                .gchat_to_name
                .lock()
                .unwrap()
                .insert(gchat.to_string(), normalized.to_string());
            self.0
                .name_to_gchat
                .lock()
                .unwrap()
                .insert(normalized.to_string(), gchat.to_string());
        }
        emoji
    }

    /// Normalize a raw Slack `:shortcode:` (without colons) into the registry's emoji.
    pub fn from_slack(&self, raw: &str) -> Emoji {
        let name = self
            .0
            .slack_to_name
            .lock()
            .unwrap()
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string());
        self.normalized(&name)
    }

    /// Normalize a raw Google Chat reaction code into the registry's emoji.
    pub fn from_gchat(&self, raw: &str) -> Emoji {
        let name = self
            .0
            .gchat_to_name
            .lock()
            .unwrap()
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string());
        self.normalized(&name)
    }

    pub fn to_slack(&self, emoji: &Emoji) -> String {
        self.0
            .name_to_slack
            .lock()
            .unwrap()
            .get(emoji.name())
            .cloned()
            .unwrap_or_else(|| emoji.name().to_string())
    }

    pub fn to_gchat(&self, emoji: &Emoji) -> String {
        self.0
            .name_to_gchat
            .lock()
            .unwrap()
            .get(emoji.name())
            .cloned()
            .unwrap_or_else(|| emoji.name().to_string())
    }

    /// Whether a raw platform emoji code refers to the given normalized emoji.
    pub fn matches(&self, raw_emoji: &str, normalized: &Emoji) -> bool {
        self.from_slack(raw_emoji) == *normalized
            || self.from_gchat(raw_emoji) == *normalized
            || self.normalized(raw_emoji) == *normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_are_identity_equal() {
        let a = registry().extend("custom_one", None, None);
        let b = registry().extend("custom_one", None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_names_are_not_equal() {
        let a = registry().extend("custom_two", None, None);
        let b = registry().extend("custom_three", None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn slack_round_trip() {
        let thumbsup = registry().extend("thumbsup", Some("+1"), None);
        assert_eq!(registry().from_slack("+1"), thumbsup);
        assert_eq!(registry().to_slack(&thumbsup), "+1");
    }

    #[test]
    fn matches_across_platforms() {
        let heart = registry().extend("heart_test", Some("heart_test_slack"), Some("heart_test_gchat"));
        assert!(registry().matches("heart_test_slack", &heart));
        assert!(registry().matches("heart_test_gchat", &heart));
        assert!(!registry().matches("other", &heart));
    }
}
