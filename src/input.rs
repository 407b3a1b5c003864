use std::fs;
use std::path::Path;

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::client::parse_count;

/// One note to crawl, resolved from the input list or from search.
/// Round-trips through the input format: encoding and re-parsing yields the
/// same `(note_id, xsec_token)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteDescriptor {
    pub note_id: String,
    pub xsec_token: String,
    pub note_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A parsed input list: wrapped object or bare array.
#[derive(Debug, Clone, Default)]
pub struct NoteList {
    pub query: Option<String>,
    pub notes: Vec<NoteDescriptor>,
}

/// Raw wire descriptor before resolution; either `note_url` or both
/// `note_id` and `xsec_token` must be present.
#[derive(Debug, Clone, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    note_url: Option<String>,
    #[serde(default)]
    note_id: Option<String>,
    #[serde(default)]
    xsec_token: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    comment_count: Option<Value>,
    #[serde(default)]
    interact_info: Option<RawInteract>,
    #[serde(default)]
    search_query: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawInteract {
    #[serde(default)]
    comment_count: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputFile {
    Wrapped(WrappedInput),
    Bare(Vec<RawDescriptor>),
}

#[derive(Debug, Deserialize)]
struct WrappedInput {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    search_info: Option<SearchInfo>,
    notes: Vec<RawDescriptor>,
}

#[derive(Debug, Deserialize)]
struct SearchInfo {
    #[serde(default)]
    query: Option<String>,
}

pub fn synthesize_url(explore_host: &str, note_id: &str, xsec_token: &str) -> String {
    let mut url = Url::parse(&format!("https://{explore_host}/explore/{note_id}"))
        .unwrap_or_else(|_| Url::parse("https://invalid.invalid/").expect("static url"));
    url.query_pairs_mut().append_pair("xsec_token", xsec_token);
    url.to_string()
}

/// Extract `(note_id, xsec_token)` from a note URL of the
/// `…/explore/<id>?xsec_token=<token>` shape. Extra query parameters are
/// ignored; a missing token yields an empty string (the caller decides
/// whether comments are reachable without one).
pub fn parse_note_url(raw: &str) -> Result<(String, String)> {
    let url = Url::parse(raw).map_err(|e| eyre!("invalid note url '{raw}': {e}"))?;
    let mut segments = url
        .path_segments()
        .ok_or_else(|| eyre!("note url '{raw}' has no path"))?;
    let note_id = match segments.find(|s| *s == "explore") {
        Some(_) => segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| eyre!("note url '{raw}' has no note id after /explore/"))?
            .to_string(),
        None => return Err(eyre!("note url '{raw}' is not an /explore/ url")),
    };
    let xsec_token = url
        .query_pairs()
        .find(|(k, _)| k == "xsec_token")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default();
    Ok((note_id, xsec_token))
}

impl RawDescriptor {
    fn resolve(self, explore_host: &str) -> Result<NoteDescriptor> {
        let comment_count = self
            .comment_count
            .as_ref()
            .or(self
                .interact_info
                .as_ref()
                .and_then(|i| i.comment_count.as_ref()))
            .map(parse_count);

        let (note_id, xsec_token, note_url) = if let Some(url) = self.note_url {
            let (id, token) = parse_note_url(&url)?;
            // The token embedded in the URL wins; a separate field is only a
            // fallback for lists that carry both.
            let token = if token.is_empty() {
                self.xsec_token.unwrap_or_default()
            } else {
                token
            };
            (id, token, url)
        } else {
            let note_id = self
                .note_id
                .filter(|s| !s.is_empty())
                .ok_or_else(|| eyre!("descriptor needs note_url, or note_id with xsec_token"))?;
            let xsec_token = self
                .xsec_token
                .filter(|s| !s.is_empty())
                .ok_or_else(|| eyre!("descriptor for '{note_id}' is missing xsec_token"))?;
            let url = synthesize_url(explore_host, &note_id, &xsec_token);
            (note_id, xsec_token, url)
        };

        Ok(NoteDescriptor {
            note_id,
            xsec_token,
            note_url,
            title: self.title,
            comment_count,
            source: self.search_query,
        })
    }
}

/// Parse an input list from JSON text.
pub fn parse_note_list(raw: &str, explore_host: &str) -> Result<NoteList> {
    let file: InputFile =
        serde_json::from_str(raw).map_err(|e| eyre!("input list is not valid JSON: {e}"))?;
    let (query, raw_notes) = match file {
        InputFile::Wrapped(w) => {
            let query = w.query.or(w.search_info.and_then(|s| s.query));
            (query, w.notes)
        }
        InputFile::Bare(notes) => (None, notes),
    };

    let mut notes = Vec::with_capacity(raw_notes.len());
    for (i, raw_note) in raw_notes.into_iter().enumerate() {
        match raw_note.resolve(explore_host) {
            Ok(descriptor) => notes.push(descriptor),
            Err(err) => tracing::warn!(index = i, error = %err, "skipping bad descriptor"),
        }
    }
    if notes.is_empty() {
        return Err(eyre!("input list contains no usable note descriptors"));
    }
    Ok(NoteList { query, notes })
}

pub fn load_note_list(path: &Path, explore_host: &str) -> Result<NoteList> {
    let raw = fs::read_to_string(path)
        .map_err(|e| eyre!("failed to read input list {}: {e}", path.display()))?;
    let list = parse_note_list(&raw, explore_host)?;
    tracing::info!(
        notes = list.notes.len(),
        path = %path.display(),
        "input list loaded"
    );
    Ok(list)
}

/// Build descriptors straight from note URLs passed on the command line.
pub fn descriptors_from_urls(urls: &[String]) -> Result<Vec<NoteDescriptor>> {
    let mut notes = Vec::with_capacity(urls.len());
    for raw in urls {
        let (note_id, xsec_token) = parse_note_url(raw)?;
        notes.push(NoteDescriptor {
            note_id,
            xsec_token,
            note_url: raw.clone(),
            title: None,
            comment_count: None,
            source: None,
        });
    }
    Ok(notes)
}
