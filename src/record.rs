use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Labels a truncated post carries until its "see more" affordance is clicked.
pub const TRUNCATION_SENTINELS: &[&str] = &["查看更多", "See More", "See more"];

/// Normalized timestamp used when no time text could be found at all.
pub const UNKNOWN_TIME: &str = "unknown";

/// Characters of content that take part in the identity key.
pub const KEY_PREFIX_CHARS: usize = 150;

pub const EXTRACTED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: String,
    pub comments: String,
    pub shares: String,
}

impl Engagement {
    /// True if any counter shows something other than an empty/zero value.
    pub fn any_nonzero(&self) -> bool {
        [&self.likes, &self.comments, &self.shares]
            .iter()
            .any(|c| !matches!(c.trim(), "" | "0"))
    }
}

/// One harvested post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content: String,
    pub engagement: Engagement,
    pub raw_timestamp: String,
    pub timestamp: String,
    pub url: String,
    pub extracted_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub prefix: String,
    pub timestamp: String,
}

impl IdentityKey {
    /// Keys that only show up for decorative containers, never real posts.
    pub fn is_noise(&self) -> bool {
        let ts = self.timestamp.as_str();
        (self.prefix.is_empty() && (ts.is_empty() || ts == UNKNOWN_TIME))
            || (self.prefix == UNKNOWN_TIME && ts.is_empty())
    }
}

impl Record {
    pub fn identity_key(&self) -> IdentityKey {
        let prefix: String = self.content.trim().chars().take(KEY_PREFIX_CHARS).collect();
        IdentityKey {
            prefix: prefix.trim().to_string(),
            timestamp: self.timestamp.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !is_truncated(&self.content)
    }

    pub fn content_len(&self) -> usize {
        self.content.trim().chars().count()
    }
}

pub fn is_truncated(text: &str) -> bool {
    TRUNCATION_SENTINELS.iter().any(|s| text.contains(s))
}

pub fn count_truncated(records: &[Record]) -> usize {
    records.iter().filter(|r| !r.is_complete()).count()
}

pub fn complete_only(records: &[Record]) -> Vec<Record> {
    records.iter().filter(|r| r.is_complete()).cloned().collect()
}

#[cfg(test)]
pub(crate) fn sample(content: &str, timestamp: &str) -> Record {
    Record {
        content: content.to_string(),
        engagement: Engagement {
            likes: "12".into(),
            comments: "3".into(),
            shares: "1".into(),
        },
        raw_timestamp: timestamp.to_string(),
        timestamp: timestamp.to_string(),
        url: String::new(),
        extracted_at: NaiveDateTime::parse_from_str("2024-06-01 12:00:00", EXTRACTED_AT_FORMAT)
            .unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness_follows_sentinels() {
        assert!(sample("full text", "2024-06-01 10:00").is_complete());
        assert!(!sample("cut off… 查看更多", "2024-06-01 10:00").is_complete());
        assert!(!sample("cut off... See more", "2024-06-01 10:00").is_complete());
    }

    #[test]
    fn identity_key_uses_fixed_prefix() {
        let long = "字".repeat(200);
        let a = sample(&format!("{long}A"), "t");
        let b = sample(&format!("{long}B"), "t");
        assert_eq!(a.identity_key(), b.identity_key());
        assert_eq!(a.identity_key().prefix.chars().count(), KEY_PREFIX_CHARS);
        assert_ne!(a.identity_key(), sample(&long, "other").identity_key());
    }

    #[test]
    fn noise_keys() {
        assert!(sample("", "").identity_key().is_noise());
        assert!(sample("  ", UNKNOWN_TIME).identity_key().is_noise());
        assert!(sample(UNKNOWN_TIME, "").identity_key().is_noise());
        assert!(!sample("", "2024-01-01 00:00").identity_key().is_noise());
        assert!(!sample("hello", "").identity_key().is_noise());
    }

    #[test]
    fn engagement_nonzero() {
        let mut e = Engagement {
            likes: "0".into(),
            comments: "0".into(),
            shares: "".into(),
        };
        assert!(!e.any_nonzero());
        e.shares = "2".into();
        assert!(e.any_nonzero());
    }
}
