//! Listing helpers for sections that degrade to an empty list instead of
//! failing the whole page.

use tracing::{info, warn};

use crate::error::FetchResult;
use crate::models::MovieSummary;
use crate::tmdb::MovieApi;

/// Collapses a failed fetch into an empty list, logging what was lost.
pub fn or_empty<T>(result: FetchResult<Vec<T>>, what: &str) -> Vec<T> {
    match result {
        Ok(items) => {
            if items.is_empty() {
                info!("No {} found", what);
            }
            items
        }
        Err(e) => {
            warn!("Failed to fetch {}: {}", what, e);
            Vec::new()
        }
    }
}

/// Recommendations seeded by the first favorite; empty without favorites.
pub async fn recommended_for(api: &dyn MovieApi, favorites: &[String]) -> Vec<MovieSummary> {
    let Some(seed) = favorites.first() else {
        return Vec::new();
    };
    or_empty(
        api.fetch_recommended(seed).await,
        &format!("recommendations for {seed}"),
    )
}

pub async fn similar_to(api: &dyn MovieApi, id: &str) -> Vec<MovieSummary> {
    or_empty(api.fetch_similar(id).await, &format!("similar movies for {id}"))
}

pub async fn search(api: &dyn MovieApi, query: &str) -> Vec<MovieSummary> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }
    or_empty(api.search(query).await, &format!("search results for '{query}'"))
}
