use serde::{Deserialize, Serialize};

use crate::domain::MessageRef;

/// Media category of an archived item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
    Animation,
    Voice,
    VideoNote,
    Sticker,
    #[default]
    #[serde(other)]
    Unknown,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Animation => "animation",
            MediaKind::Voice => "voice",
            MediaKind::VideoNote => "video_note",
            MediaKind::Sticker => "sticker",
            MediaKind::Unknown => "unknown",
        }
    }
}

/// Pointer into the remote index for a published record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(pub String);

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single archived content item, shared by its opaque `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: String,
    /// Where the original lives (archive chat + message id).
    pub location: MessageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub kind: MediaKind,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_locator: Option<Locator>,
}

impl ContentRecord {
    pub fn new(
        location: MessageRef,
        display_name: Option<String>,
        kind: MediaKind,
        created_at: i64,
    ) -> Self {
        Self {
            id: new_record_id(),
            location,
            display_name,
            kind,
            created_at,
            remote_locator: None,
        }
    }

    /// Caption used when the item is re-delivered.
    pub fn caption(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// An ordered group of content ids shared under one link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    /// Display order. Duplicates are allowed and delivered twice.
    pub member_ids: Vec<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_locator: Option<Locator>,
}

impl BatchRecord {
    pub fn new(member_ids: Vec<String>, created_at: i64) -> Self {
        Self {
            id: new_record_id(),
            member_ids,
            created_at,
            remote_locator: None,
        }
    }
}

/// What gets published to the remote index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexEntry {
    File(ContentRecord),
    Batch(BatchRecord),
}

impl IndexEntry {
    pub fn id(&self) -> &str {
        match self {
            IndexEntry::File(r) => &r.id,
            IndexEntry::Batch(b) => &b.id,
        }
    }

    /// Tag convention that distinguishes files from batches in the index.
    pub fn tag(&self) -> String {
        match self {
            IndexEntry::File(r) => file_tag(&r.id),
            IndexEntry::Batch(b) => batch_tag(&b.id),
        }
    }
}

pub fn file_tag(id: &str) -> String {
    format!("#file_{}", tag_safe(id))
}

pub fn batch_tag(id: &str) -> String {
    format!("#batch_{}", tag_safe(id))
}

// Hashtags stop at `-`; keep ids searchable as one token.
fn tag_safe(id: &str) -> String {
    id.replace('-', "_")
}

/// Fresh unguessable record id (random UUID v4).
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_media_kinds_decode_as_unknown() {
        let k: MediaKind = serde_json::from_str("\"hologram\"").unwrap();
        assert_eq!(k, MediaKind::Unknown);
        let k: MediaKind = serde_json::from_str("\"video_note\"").unwrap();
        assert_eq!(k, MediaKind::VideoNote);
    }

    #[test]
    fn tags_distinguish_files_from_batches() {
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        assert_eq!(file_tag(id), "#file_0f8fad5b_d9cb_469f_a165_70867728950e");
        assert!(batch_tag(id).starts_with("#batch_"));
        assert_ne!(file_tag(id), batch_tag(id));
    }

    #[test]
    fn blank_display_names_produce_no_caption() {
        let mut r = ContentRecord::new(MessageRef::new(-1, 5), Some("  ".into()), MediaKind::Photo, 0);
        assert_eq!(r.caption(), None);
        r.display_name = Some("Season 1".into());
        assert_eq!(r.caption(), Some("Season 1"));
    }

    #[test]
    fn record_ids_are_unique() {
        assert_ne!(new_record_id(), new_record_id());
    }
}
