//! Key and channel naming.
//!
//! Every key is `<prefix><subsystem>:<id>[:<part>]`.  The prefix is the
//! deployment namespace (e.g. `myapp:`) and keeps tenants sharing one store
//! apart; the subsystem tag keeps components apart.  Keys never embed
//! anything process-specific, so persisted ids survive restarts.

use std::fmt;

/// Component tag placed right after the deployment prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Lock,
    Work,
    Inval,
    Kv,
    Transient,
    Pubsub,
}

impl Subsystem {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Work => "work",
            Self::Inval => "inval",
            Self::Kv => "kv",
            Self::Transient => "transient",
            Self::Pubsub => "pubsub",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `<prefix><subsystem>:`, the common head of every key of a subsystem.
    pub fn subsystem_prefix(&self, subsystem: Subsystem) -> String {
        format!("{}{}:", self.prefix, subsystem.tag())
    }

    pub fn key(&self, subsystem: Subsystem, id: &str) -> String {
        format!("{}{}:{id}", self.prefix, subsystem.tag())
    }

    pub fn key_part(&self, subsystem: Subsystem, id: &str, part: &str) -> String {
        format!("{}{}:{id}:{part}", self.prefix, subsystem.tag())
    }

    /// Channel carrying messages for `topic`.
    pub fn channel(&self, topic: &str) -> String {
        self.key(Subsystem::Pubsub, topic)
    }

    /// Glob pattern matching every key of `subsystem`.
    pub fn subsystem_pattern(&self, subsystem: Subsystem) -> String {
        format!("{}*", glob_escape(&self.subsystem_prefix(subsystem)))
    }

    /// Glob pattern matching every channel of this namespace.
    pub fn pattern(&self) -> String {
        self.subsystem_pattern(Subsystem::Pubsub)
    }

    /// Inverse of [`Namespace::channel`].  `None` for foreign channels.
    pub fn topic_of<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(Subsystem::Pubsub.tag())?
            .strip_prefix(':')
    }
}

/// Escape the glob metacharacters of `text` so that it matches literally in
/// a `KEYS` or `PSUBSCRIBE` pattern.
pub fn glob_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        let ns = Namespace::new("app:");
        assert_eq!(ns.key(Subsystem::Lock, "doc-1"), "app:lock:doc-1");
        assert_eq!(
            ns.key_part(Subsystem::Work, "q1", "scheduled"),
            "app:work:q1:scheduled"
        );
    }

    #[test]
    fn channel_round_trip() {
        let ns = Namespace::new("app:");
        let channel = ns.channel("inval:default");
        assert_eq!(channel, "app:pubsub:inval:default");
        assert_eq!(ns.topic_of(&channel), Some("inval:default"));
        assert_eq!(ns.pattern(), "app:pubsub:*");
    }

    #[test]
    fn patterns_escape_the_prefix() {
        let ns = Namespace::new("t[1]*:");
        assert_eq!(ns.pattern(), "t\\[1\\]\\*:pubsub:*");
        assert_eq!(ns.subsystem_pattern(Subsystem::Kv), "t\\[1\\]\\*:kv:*");
        assert_eq!(glob_escape("plain:"), "plain:");
    }

    #[test]
    fn foreign_channel_has_no_topic() {
        let ns = Namespace::new("app:");
        assert_eq!(ns.topic_of("other:pubsub:x"), None);
        assert_eq!(ns.topic_of("app:lock:x"), None);
    }
}
