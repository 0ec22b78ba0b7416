use tracing::info;

use crate::error::Result;
use crate::permissions::{check_image_catalog_permission, PermissionNode};
use crate::upstream_client::UpstreamClient;

/// Outcome of a single `/v2/_catalog` request: the permission-filtered
/// page and, if there is more to see, the upstream cursor to resume
/// from.
pub struct CatalogResult {
    pub repositories: Vec<String>,
    pub next_last: Option<String>,
}

fn strip_project_prefix(name: &str, prefix: &str) -> Option<String> {
    let full = format!("{prefix}/");
    name.strip_prefix(&full).map(str::to_string)
}

/// Implements the oversampling + corrective-fetch catalog paging
/// algorithm (spec.md §4.6): the client-requested page size is honored
/// exactly even though the upstream may interleave invisible entries.
pub async fn handle_catalog(
    upstream: &UpstreamClient,
    tree: &PermissionNode,
    project_prefix: &str,
    requested_n: usize,
    requested_last: Option<&str>,
) -> Result<CatalogResult> {
    let mut filtered: Vec<String> = Vec::new();
    let mut last_token = requested_last.unwrap_or("").to_string();
    let mut more_images = false;
    let mut last_token_is_correct = false;
    let mut final_index = 0usize;

    loop {
        let n = std::cmp::max(requested_n.saturating_sub(filtered.len()), upstream.max_catalog_entries);
        let last_for_fetch = last_token.clone();
        let page = upstream
            .fetch_catalog_page(n, if last_for_fetch.is_empty() { None } else { Some(&last_for_fetch) })
            .await?;

        if page.repositories.is_empty() {
            last_token = String::new();
            break;
        }

        let mut index = 0usize;
        let mut reached_target = false;
        for name in &page.repositories {
            index += 1;
            let stripped = match strip_project_prefix(name, project_prefix) {
                Some(s) => s,
                None => {
                    info!(image = %name, "Bad image: expected project prefix in catalog entry (skipping)");
                    continue;
                }
            };
            if check_image_catalog_permission(&stripped, tree) {
                filtered.push(stripped);
            }
            if filtered.len() == requested_n {
                reached_target = true;
                break;
            }
        }

        if reached_target {
            final_index = index;
            more_images = page.next.is_some() || index < page.repositories.len();
            if index == page.repositories.len() {
                last_token_is_correct = true;
                last_token = page.next.as_ref().map(|(_, l)| l.clone()).unwrap_or_default();
            }
            break;
        }

        match page.next {
            Some((_, next_last)) => last_token = next_last,
            None => {
                last_token = String::new();
                break;
            }
        }
    }

    if more_images && !last_token_is_correct {
        let page = upstream.fetch_catalog_page(final_index, Some(&last_token)).await?;
        last_token = page.next.map(|(_, l)| l).unwrap_or_default();
    }

    let next_last = if last_token.is_empty() { None } else { Some(last_token) };
    Ok(CatalogResult {
        repositories: filtered,
        next_last,
    })
}
