//! Topic identifiers
//!
//! A topic is the identifier a subscriber or push event is keyed on: a
//! channel id or a playlist id. The hub names topics by feed URL, e.g.
//! `https://example.com/feeds/videos.xml?channel_id=UCabc123`; the id is
//! carried in the URL's query string.
//!
//! Ids must match `[a-zA-Z0-9_-]+`.

use std::fmt;
use thiserror::Error;

/// Hard cap on topics per streaming subscription
pub const MAX_SUBSCRIPTION_TOPICS: usize = 1000;

fn is_valid_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_valid_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_id_char)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic id cannot be empty")]
    Empty,

    #[error("invalid topic id '{0}': must match [a-zA-Z0-9_-]+")]
    InvalidId(String),

    #[error("topic URL carries no channel_id or playlist_id")]
    MissingId,
}

/// A subscription topic: a channel or playlist on the upstream origin
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Channel(String),
    Playlist(String),
}

impl Topic {
    pub fn channel(id: &str) -> Result<Self, TopicError> {
        if !is_valid_id(id) {
            return Err(invalid(id));
        }
        Ok(Topic::Channel(id.to_string()))
    }

    pub fn playlist(id: &str) -> Result<Self, TopicError> {
        if !is_valid_id(id) {
            return Err(invalid(id));
        }
        Ok(Topic::Playlist(id.to_string()))
    }

    /// Extract the topic from a hub topic URL's query string
    pub fn from_topic_url(url: &str) -> Result<Self, TopicError> {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("channel_id", id)) => return Topic::channel(id),
                Some(("playlist_id", id)) => return Topic::playlist(id),
                _ => continue,
            }
        }
        Err(TopicError::MissingId)
    }

    /// The bare id the dispatcher keys on
    pub fn id(&self) -> &str {
        match self {
            Topic::Channel(id) | Topic::Playlist(id) => id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Parse a comma-separated topic list from a subscription request:
/// deduplicated, invalid ids rejected, capped at
/// [`MAX_SUBSCRIPTION_TOPICS`] entries.
pub fn parse_topic_list(raw: &str) -> Result<Vec<String>, TopicError> {
    let mut topics = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !is_valid_id(part) {
            return Err(invalid(part));
        }
        if !topics.iter().any(|t| t == part) {
            topics.push(part.to_string());
        }
        if topics.len() == MAX_SUBSCRIPTION_TOPICS {
            break;
        }
    }
    if topics.is_empty() {
        return Err(TopicError::Empty);
    }
    Ok(topics)
}

fn invalid(id: &str) -> TopicError {
    if id.is_empty() {
        TopicError::Empty
    } else {
        TopicError::InvalidId(id.to_string())
    }
}
