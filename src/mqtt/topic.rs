//! Topic names, topic filters and wildcard matching
//!
//! Filters are `/`-separated segments where `+` stands for exactly one segment and a
//! trailing `#` for zero or more. Topics starting with `$` are reserved for the broker
//! and are never matched by a filter whose first segment is a wildcard.

use std::fmt;
use std::str::FromStr;

use super::error::ValidationError;

const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Tests whether a concrete topic is matched by a filter
///
/// Both arguments are assumed valid; use [`validate_filter`] and [`validate_topic_name`]
/// at the boundary.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Checks a topic filter before it is sent in a SUBSCRIBE or UNSUBSCRIBE
pub fn validate_filter(filter: &str) -> Result<(), ValidationError> {
    check_common(filter)?;

    let invalid = |reason| ValidationError::InvalidFilter {
        filter: filter.to_string(),
        reason,
    };

    let mut segments = filter.split('/').peekable();
    while let Some(segment) = segments.next() {
        match segment {
            "#" if segments.peek().is_some() => {
                return Err(invalid("'#' must be the last segment"))
            }
            "#" | "+" => {}
            s if s.contains('#') => return Err(invalid("'#' must occupy a whole segment")),
            s if s.contains('+') => return Err(invalid("'+' must occupy a whole segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Checks a topic name before it is used in a PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(ValidationError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

fn check_common(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if value.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TooLong(value.len()));
    }
    if value.contains('\0') {
        return Err(ValidationError::NullCharacter);
    }
    Ok(())
}

/// A topic filter that passed validation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(filter: impl Into<String>) -> Result<Self, ValidationError> {
        let filter = filter.into();
        validate_filter(&filter)?;
        Ok(Self(filter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, topic: &str) -> bool {
        matches(&self.0, topic)
    }

    pub fn has_wildcards(&self) -> bool {
        self.0.contains(['+', '#'])
    }
}

impl FromStr for TopicFilter {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl AsRef<str> for TopicFilter {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_level_wildcard() {
        assert!(matches("sport/+/score", "sport/tennis/score"));
        assert!(matches("+/+", "sport/tennis"));
        assert!(!matches("sport/+", "sport/tennis/score"));
        assert!(!matches("sport/+", "sport"));
        assert!(matches("sport/+", "sport/"));
        assert!(matches("+", "+"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("sport/#", "sport/tennis/score"));
        assert!(matches("sport/#", "sport"));
        assert!(matches("#", "sport/tennis"));
        assert!(matches("sport/tennis/#", "sport/tennis"));
        assert!(!matches("sport/#", "sports"));
    }

    #[test]
    fn literal_segments_must_match_exactly() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/B", "a/b"));
    }

    #[test]
    fn system_topics_hide_from_leading_wildcards() {
        assert!(matches("$SYS/#", "$SYS/uptime"));
        assert!(!matches("#", "$SYS/uptime"));
        assert!(!matches("+/uptime", "$SYS/uptime"));
        assert!(matches("$SYS/+", "$SYS/uptime"));
    }

    #[test]
    fn filter_validation() {
        for ok in ["a", "a/b", "+", "#", "a/+/c", "a/#", "+/+/#", "/", "a//b"] {
            assert!(validate_filter(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["a#b", "sport/#/more", "a+/b", "a/b+", "#/a"] {
            assert!(
                matches!(validate_filter(bad), Err(ValidationError::InvalidFilter { .. })),
                "{} should be rejected",
                bad
            );
        }
        assert_eq!(validate_filter(""), Err(ValidationError::EmptyTopic));
        assert_eq!(validate_filter("a\0b"), Err(ValidationError::NullCharacter));
    }

    #[test]
    fn topic_names_reject_wildcards() {
        assert!(validate_topic_name("sensors/temperature-humidity").is_ok());
        assert!(matches!(
            validate_topic_name("a/+"),
            Err(ValidationError::WildcardInTopic(_))
        ));
        assert!(validate_topic_name(&"x".repeat(70_000)).is_err());
    }

    #[test]
    fn topic_filter_parses() {
        let filter: TopicFilter = "home/+/temp".parse().unwrap();
        assert!(filter.has_wildcards());
        assert!(filter.matches("home/kitchen/temp"));
        assert!("home/#/temp".parse::<TopicFilter>().is_err());
    }
}
