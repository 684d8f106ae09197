//! Topic routing: dot-delimited routing keys matched against binding patterns.
//!
//! `*` matches exactly one segment and `#` matches zero or more segments. Every other segment
//! must match literally.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    pattern: String,
}

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let pattern: Vec<&str> = self.pattern.split('.').collect();
        let key: Vec<&str> = routing_key.split('.').collect();
        matches_segments(&pattern, &key)
    }
}

impl From<&str> for TopicPattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` may swallow any number of segments, including none.
            (0..=key.len()).any(|skip| matches_segments(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && matches_segments(rest, &key[1..]),
        Some((literal, rest)) => {
            key.first() == Some(literal) && matches_segments(rest, &key[1..])
        }
    }
}
