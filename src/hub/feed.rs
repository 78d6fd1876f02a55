//! Webhook feed body parsing
//!
//! The hub delivers an Atom-like document: a `<feed>` of `<entry>` elements,
//! each carrying a video id, channel id, title, author and timestamps.
//! Entries missing a video id are skipped individually; only a syntactically
//! broken document fails the whole parse.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed feed payload: {0}")]
    Malformed(String),
}

/// One `<entry>` from a delivered feed page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub video_id: String,
    pub channel_id: Option<String>,
    pub title: String,
    pub author: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct PartialEntry {
    video_id: Option<String>,
    channel_id: Option<String>,
    title: Option<String>,
    author: Option<String>,
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
}

impl PartialEntry {
    fn finish(self) -> Option<FeedEntry> {
        Some(FeedEntry {
            video_id: self.video_id?,
            channel_id: self.channel_id,
            title: self.title.unwrap_or_default(),
            author: self.author.unwrap_or_default(),
            published: self.published,
            updated: self.updated,
        })
    }
}

/// Parse a feed body into its entries
pub fn parse_feed(body: &[u8]) -> Result<Vec<FeedEntry>, FeedError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<PartialEntry> = None;
    let mut element: Vec<u8> = Vec::new();
    let mut in_author = false;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                match e.name().as_ref() {
                    b"entry" => current = Some(PartialEntry::default()),
                    b"author" => in_author = true,
                    _ => {}
                }
                element = e.name().as_ref().to_vec();
            }
            Ok(Event::Text(t)) => {
                if let Some(ref mut entry) = current {
                    let text = t
                        .unescape()
                        .map_err(|e| FeedError::Malformed(e.to_string()))?
                        .into_owned();
                    fill(entry, &element, in_author, text);
                }
            }
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"entry" => {
                        if let Some(partial) = current.take() {
                            match partial.finish() {
                                Some(entry) => entries.push(entry),
                                // Isolated: a bad entry never aborts its siblings
                                None => warn!("skipping feed entry without video id"),
                            }
                        }
                    }
                    b"author" => in_author = false,
                    _ => {}
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(FeedError::Malformed(e.to_string())),
        }
        buf.clear();
    }

    Ok(entries)
}

fn fill(entry: &mut PartialEntry, element: &[u8], in_author: bool, text: String) {
    match element {
        b"yt:videoId" | b"videoId" => entry.video_id = Some(text),
        b"yt:channelId" | b"channelId" => entry.channel_id = Some(text),
        b"title" => entry.title = Some(text),
        b"name" if in_author => entry.author = Some(text),
        b"published" => entry.published = parse_rfc3339(&text),
        b"updated" => entry.updated = parse_rfc3339(&text),
        // The feed-level <id> wraps the video id as "yt:video:<id>"
        b"id" if entry.video_id.is_none() => {
            if let Some(id) = text.strip_prefix("yt:video:") {
                entry.video_id = Some(id.to_string());
            }
        }
        _ => {}
    }
}

fn parse_rfc3339(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
