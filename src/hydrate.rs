use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::models::MovieDetails;
use crate::tmdb::MovieApi;

/// Resolves each id to its detail record, all requests in flight at once.
///
/// Ids that fail for any reason are logged and left out; the survivors keep
/// their input order. Never fails as a whole.
pub async fn hydrate(api: &dyn MovieApi, ids: &[String]) -> Vec<MovieDetails> {
    if ids.is_empty() {
        return Vec::new();
    }
    info!(count = ids.len(), "Hydrating movies");

    let fetches = ids.iter().map(|id| async move {
        match api.fetch_movie(id).await {
            Ok(movie) => Some(movie),
            Err(e) => {
                warn!(movie_id = %id, "Skipping movie that failed to load: {}", e);
                None
            }
        }
    });
    let movies: Vec<MovieDetails> = join_all(fetches).await.into_iter().flatten().collect();

    debug!(requested = ids.len(), loaded = movies.len(), "Hydration finished");
    movies
}

/// Monotonic request counter used to drop results of superseded requests.
///
/// There is no cancellation: an older request still completes, its caller
/// just checks [`RequestGeneration::is_current`] before using the result.
#[derive(Debug, Default)]
pub struct RequestGeneration {
    latest: AtomicU64,
}

impl RequestGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new request and supersedes every earlier one.
    pub fn begin(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Ticket for a reader that must not supersede other readers.
    pub fn current(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, ticket: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket
    }
}
