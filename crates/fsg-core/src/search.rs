//! Keyword search over the local record store.
//!
//! Query syntax: free words match display names (substring, case-insensitive)
//! and media kinds (exact); `date:YYYY-MM-DD` matches the UTC creation day;
//! `link:<share link or id>` matches the record the link points at. Any
//! criterion matching is enough. A batch matches when one of its members does,
//! or when the link points at the batch itself.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::{
    clock::from_unix,
    records::{BatchRecord, ContentRecord},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Lowercased free text.
    pub keywords: Option<String>,
    pub date: Option<NaiveDate>,
    /// Record id.
    pub link: Option<String>,
}

impl SearchQuery {
    /// `None` when nothing searchable is left.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut query = SearchQuery::default();
        let mut words = Vec::new();
        for word in raw.split_whitespace() {
            let date = word
                .strip_prefix("date:")
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
            if let Some(d) = date {
                query.date = Some(d);
            } else if let Some(link) = word.strip_prefix("link:").filter(|l| !l.is_empty()) {
                query.link = Some(link_target(link).to_string());
            } else {
                words.push(word.to_lowercase());
            }
        }
        if !words.is_empty() {
            query.keywords = Some(words.join(" "));
        }
        (query != SearchQuery::default()).then_some(query)
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(k) = &self.keywords {
            parts.push(format!("keywords '{k}'"));
        }
        if let Some(d) = &self.date {
            parts.push(format!("date {d}"));
        }
        if let Some(l) = &self.link {
            parts.push(format!("link '{l}'"));
        }
        parts.join(" and ")
    }

    fn match_record(&self, r: &ContentRecord) -> Vec<&'static str> {
        let mut matched = Vec::new();
        if let Some(k) = &self.keywords {
            let in_name = r
                .display_name
                .as_deref()
                .is_some_and(|n| n.to_lowercase().contains(k.as_str()));
            if in_name {
                matched.push("name");
            }
            if r.kind.as_str() == k.as_str() {
                matched.push("type");
            }
        }
        if self
            .date
            .is_some_and(|d| from_unix(r.created_at).date_naive() == d)
        {
            matched.push("date");
        }
        if self.link.as_deref() == Some(r.id.as_str()) {
            matched.push("link");
        }
        matched
    }
}

// `https://t.me/bot?start=<id>` -> `<id>`; a bare id passes through.
fn link_target(link: &str) -> &str {
    link.rsplit_once("start=").map_or(link, |(_, id)| id)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchHit {
    File {
        record: ContentRecord,
        matched_in: Vec<&'static str>,
    },
    Batch {
        batch: BatchRecord,
        /// Display names of the members that matched.
        matching: Vec<String>,
        matched_in: Vec<&'static str>,
    },
}

impl SearchHit {
    pub fn id(&self) -> &str {
        match self {
            SearchHit::File { record, .. } => &record.id,
            SearchHit::Batch { batch, .. } => &batch.id,
        }
    }

    pub fn matched_in(&self) -> &[&'static str] {
        match self {
            SearchHit::File { matched_in, .. } | SearchHit::Batch { matched_in, .. } => matched_in,
        }
    }

    pub fn label(&self) -> String {
        match self {
            SearchHit::File { record, .. } => display_name(record),
            SearchHit::Batch {
                batch, matching, ..
            } => {
                let shown: Vec<&str> = matching.iter().take(3).map(String::as_str).collect();
                let mut label = format!("Batch ({} files)", batch.member_ids.len());
                if !shown.is_empty() {
                    label.push_str(&format!(": {}", shown.join(", ")));
                }
                if matching.len() > 3 {
                    label.push_str(&format!(" and {} more", matching.len() - 3));
                }
                label
            }
        }
    }
}

fn display_name(r: &ContentRecord) -> String {
    r.caption().unwrap_or("Unnamed file").to_string()
}

/// Match `query` against the given records, sorted by label.
pub(crate) fn run(
    query: &SearchQuery,
    files: &[(String, ContentRecord)],
    batches: &[(String, BatchRecord)],
) -> Vec<SearchHit> {
    let by_id: HashMap<&str, &ContentRecord> =
        files.iter().map(|(_, r)| (r.id.as_str(), r)).collect();

    let mut hits: Vec<SearchHit> = files
        .iter()
        .filter_map(|(_, r)| {
            let matched_in = query.match_record(r);
            (!matched_in.is_empty()).then(|| SearchHit::File {
                record: r.clone(),
                matched_in,
            })
        })
        .collect();

    for (_, batch) in batches {
        let mut matching = Vec::new();
        let mut matched_in: Vec<&'static str> = Vec::new();
        for member in &batch.member_ids {
            let Some(r) = by_id.get(member.as_str()) else {
                continue;
            };
            let m = query.match_record(r);
            if m.is_empty() {
                continue;
            }
            matching.push(display_name(r));
            for kind in m {
                if !matched_in.contains(&kind) {
                    matched_in.push(kind);
                }
            }
        }
        if query.link.as_deref() == Some(batch.id.as_str()) && !matched_in.contains(&"link") {
            matched_in.push("link");
        }
        if !matched_in.is_empty() {
            hits.push(SearchHit::Batch {
                batch: batch.clone(),
                matching,
                matched_in,
            });
        }
    }

    hits.sort_by_cached_key(SearchHit::label);
    hits
}
