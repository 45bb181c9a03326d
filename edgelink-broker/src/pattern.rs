//! MQTT topic patterns compiled for repeated matching.
//!
//! ACL checks run on every inbound packet, so patterns are parsed once at
//! authentication time and matched level-by-level afterwards.

/// A topic filter compiled into an efficient matcher.
///
/// Supports MQTT-style wildcards:
/// - `+` matches exactly one topic level
/// - `#` matches zero or more topic levels (must be at the end)
#[derive(Debug, Clone)]
pub struct TopicPattern {
    parts: Vec<PatternPart>,
    has_multi_level_wildcard: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum PatternPart {
    Literal(String),
    SingleWildcard,
    MultiWildcard,
}

impl TopicPattern {
    /// Compile a pattern string into an optimized matcher.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }

        let level_count = pattern.split('/').count();
        let mut parts = Vec::with_capacity(level_count);
        let mut has_multi_level_wildcard = false;

        for (index, part) in pattern.split('/').enumerate() {
            match part {
                "+" => parts.push(PatternPart::SingleWildcard),
                "#" => {
                    if index != level_count - 1 {
                        return Err(PatternError::MultiLevelWildcardNotAtEnd);
                    }
                    parts.push(PatternPart::MultiWildcard);
                    has_multi_level_wildcard = true;
                }
                literal => {
                    if literal.contains('+') || literal.contains('#') {
                        return Err(PatternError::InvalidWildcardUsage);
                    }
                    parts.push(PatternPart::Literal(literal.to_string()));
                }
            }
        }

        Ok(Self {
            parts,
            has_multi_level_wildcard,
        })
    }

    /// Check if a topic matches this compiled pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let topic_parts: Vec<&str> = topic.split('/').collect();

        if self.has_multi_level_wildcard {
            return self.matches_with_multi_level(&topic_parts);
        }

        if self.parts.len() != topic_parts.len() {
            return false;
        }

        self.parts
            .iter()
            .zip(topic_parts.iter())
            .all(|(pattern_part, topic_part)| match pattern_part {
                PatternPart::Literal(literal) => literal == topic_part,
                PatternPart::SingleWildcard => true,
                PatternPart::MultiWildcard => true,
            })
    }

    fn matches_with_multi_level(&self, topic_parts: &[&str]) -> bool {
        let prefix = &self.parts[..self.parts.len() - 1];

        // Topic must cover every part before the trailing `#`.
        if topic_parts.len() < prefix.len() {
            return false;
        }

        prefix
            .iter()
            .zip(topic_parts.iter())
            .all(|(pattern_part, topic_part)| match pattern_part {
                PatternPart::Literal(literal) => literal == topic_part,
                PatternPart::SingleWildcard => true,
                PatternPart::MultiWildcard => true,
            })
    }
}

/// Errors that can occur during pattern compilation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("Pattern cannot be empty")]
    EmptyPattern,
    #[error("Multi-level wildcard (#) must be at the end of the pattern")]
    MultiLevelWildcardNotAtEnd,
    #[error("Wildcards (+, #) cannot be mixed with literal text in the same level")]
    InvalidWildcardUsage,
}
