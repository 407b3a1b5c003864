use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::Local;
use eyre::{eyre, Result};
use serde_json::json;

use crate::cancel::CancelFlag;
use crate::client::{generate_search_id, EndpointClient, SearchFilters};
use crate::input::{synthesize_url, NoteDescriptor};
use crate::pool::CredentialPool;
use crate::retry::{call_with_rotation, RetryPolicy};

const INTER_SEARCH_PAGE_DELAY: Duration = Duration::from_secs(2);

/// Page the search endpoint through the credential pool until `want` note
/// descriptors are collected or the server runs out of results.
#[allow(clippy::too_many_arguments)]
pub async fn search_notes(
    client: &EndpointClient,
    pool: &CredentialPool,
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    query: &str,
    want: usize,
    filters: &SearchFilters,
    explore_host: &str,
) -> Result<Vec<NoteDescriptor>> {
    let search_id = generate_search_id();
    let mut notes: Vec<NoteDescriptor> = Vec::new();
    let mut page: u32 = 0;

    while notes.len() < want {
        if cancel.is_cancelled() {
            break;
        }
        page += 1;
        tracing::info!(query, page, collected = notes.len(), want, "searching");

        let result = call_with_rotation(pool, policy, cancel, "search page", |lease| {
            client.search_notes(lease, query, page, &search_id, filters)
        })
        .await;

        let search_page = match result {
            Ok((search_page, _lease)) => search_page,
            Err(failure) => {
                // A partial result set is still usable; only a dry first
                // page is an error.
                if notes.is_empty() {
                    return Err(eyre!("search '{query}' failed: {failure}"));
                }
                tracing::warn!(query, page, error = %failure, "search page failed; keeping partial results");
                break;
            }
        };

        for hit in search_page.hits {
            if notes.len() >= want {
                break;
            }
            if hit.xsec_token.is_empty() {
                tracing::debug!(note_id = %hit.note_id, "search hit without signed token; skipping");
                continue;
            }
            notes.push(NoteDescriptor {
                note_url: synthesize_url(explore_host, &hit.note_id, &hit.xsec_token),
                note_id: hit.note_id,
                xsec_token: hit.xsec_token,
                title: Some(hit.title).filter(|t| !t.is_empty()),
                comment_count: Some(hit.comment_count),
                source: Some(query.to_string()),
            });
        }

        if !search_page.has_more {
            break;
        }
        if !cancel.sleep(INTER_SEARCH_PAGE_DELAY).await {
            break;
        }
    }

    tracing::info!(query, found = notes.len(), "search finished");
    Ok(notes)
}

/// Write descriptors as an input-list JSON (wrapped form) consumable by the
/// crawl command.
pub fn write_search_results(
    path: &Path,
    query: &str,
    want: usize,
    notes: &[NoteDescriptor],
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create {}: {e}", parent.display()))?;
        }
    }
    let payload = json!({
        "query": query,
        "search_info": {
            "query": query,
            "require_num": want,
            "actual_num": notes.len(),
            "search_time": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        },
        "notes": notes,
    });
    let body = serde_json::to_string_pretty(&payload)
        .map_err(|e| eyre!("failed to serialize search results: {e}"))?;
    fs::write(path, body)
        .map_err(|e| eyre!("failed to write search results {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), notes = notes.len(), "search results saved");
    Ok(())
}

/// Default output path for a query: `search_results/search_<query>_<ts>.json`.
pub fn default_output_path(query: &str) -> std::path::PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let safe: String = query
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    std::path::PathBuf::from("search_results").join(format!("search_{safe}_{stamp}.json"))
}
