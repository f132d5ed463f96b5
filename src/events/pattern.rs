//! Event name patterns.
//!
//! A pattern is an event name in which `*` matches any run of characters
//! (including `.` and the empty string). `player.*` matches `player.state`
//! and `player.stats.kills`; `*` matches everything. Patterns without `*`
//! match exactly.

use regex::Regex;

/// Compiled event name pattern.
#[derive(Debug, Clone)]
pub struct EventPattern {
    source: String,
    regex: Option<Regex>,
}

impl EventPattern {
    /// Compile a pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        let source = pattern.into();
        let regex = if source.contains('*') {
            let body = source
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            // Escaped literals can't produce an invalid expression.
            Regex::new(&format!("^{}$", body)).ok()
        } else {
            None
        };
        Self { source, regex }
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True if the pattern has no wildcard.
    pub fn is_exact(&self) -> bool {
        self.regex.is_none()
    }

    /// Test an event name.
    pub fn matches(&self, name: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(name),
            None => self.source == name,
        }
    }
}

impl PartialEq for EventPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for EventPattern {}

impl From<&str> for EventPattern {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventPattern {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        let p = EventPattern::new("player.state");
        assert!(p.is_exact());
        assert!(p.matches("player.state"));
        assert!(!p.matches("player.states"));
        assert!(!p.matches("player"));
    }

    #[test]
    fn test_trailing_wildcard_crosses_dots() {
        let p = EventPattern::new("player.*");
        assert!(!p.is_exact());
        assert!(p.matches("player.state"));
        assert!(p.matches("player.stats.kills"));
        assert!(p.matches("player."));
        assert!(!p.matches("players.state"));
        assert!(!p.matches("npc.player.state"));
    }

    #[test]
    fn test_match_all() {
        let p = EventPattern::new("*");
        assert!(p.matches(""));
        assert!(p.matches("anything.at.all"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = EventPattern::new("a+b.*");
        assert!(p.matches("a+b.c"));
        assert!(!p.matches("aab.c"));
        assert!(!p.matches("a+bxc"));
    }

    #[test]
    fn test_inner_wildcard() {
        let p = EventPattern::new("chat.*.sent");
        assert!(p.matches("chat.team.sent"));
        assert!(p.matches("chat.a.b.sent"));
        assert!(!p.matches("chat.team.received"));
    }
}
