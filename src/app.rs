use crate::catalog;
use crate::config::Config;
use crate::error::FetchError;
use crate::favorites::FavoritesStore;
use crate::hydrate::{hydrate, RequestGeneration};
use crate::models::{MovieDetails, MovieSummary};
use crate::storage::{FileStore, KeyValueStore};
use crate::tmdb::{MovieApi, TmdbClient};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// A favorites hydration superseded by a toggle is re-run at most this often.
const MAX_HYDRATION_ATTEMPTS: usize = 2;

#[derive(Clone)]
pub struct AppState {
    pub api: Arc<dyn MovieApi>,
    pub favorites: Arc<FavoritesStore>,
    pub hydration: Arc<RequestGeneration>,
}

impl AppState {
    pub fn new(api: Arc<dyn MovieApi>, favorites: Arc<FavoritesStore>) -> Self {
        Self {
            api,
            favorites,
            hydration: Arc::new(RequestGeneration::new()),
        }
    }

    /// Supersedes in-flight hydrations whenever the favorites list changes,
    /// including changes written by another view or process.
    pub fn supersede_on_change(&self) -> JoinHandle<()> {
        let mut changes = self.favorites.subscribe();
        let hydration = self.hydration.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let count = changes.borrow_and_update().len();
                let generation = hydration.begin();
                debug!(count, generation, "Favorites list changed");
            }
        })
    }
}

/// Error surface for a failed page-level fetch. Section-level failures never
/// get here; they degrade to empty lists.
#[derive(Debug)]
pub struct PageError {
    status: StatusCode,
    message: String,
    retry: bool,
}

impl PageError {
    fn from_fetch(err: FetchError, message: &str) -> Self {
        warn!("{}: {}", message, err);
        match err {
            FetchError::NotFound(_) => Self {
                status: StatusCode::NOT_FOUND,
                message: "Movie not found".to_string(),
                retry: false,
            },
            FetchError::InvalidId(id) => Self {
                status: StatusCode::BAD_REQUEST,
                message: format!("'{id}' is not a valid movie id"),
                retry: false,
            },
            _ => Self {
                status: StatusCode::BAD_GATEWAY,
                message: message.to_string(),
                retry: true,
            },
        }
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "retry": self.retry,
        }));
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HomePage {
    pub trending: Vec<MovieSummary>,
    pub recommended: Vec<MovieSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MoviePage {
    pub movie: MovieDetails,
    pub similar: Vec<MovieSummary>,
    pub is_favorite: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchPage {
    pub query: String,
    pub results: Vec<MovieSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FavoritesPage {
    pub ids: Vec<String>,
    pub movies: Vec<MovieDetails>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FavoriteToggled {
    pub ids: Vec<String>,
    pub is_favorite: bool,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

pub async fn run_server(config: Config) -> Result<()> {
    let api: Arc<dyn MovieApi> = Arc::new(TmdbClient::from_config(&config)?);

    let file_store = Arc::new(FileStore::open(&config.store_path));
    let _watcher = file_store.spawn_watcher(config.watch_interval);
    let store: Arc<dyn KeyValueStore> = file_store;
    let favorites = Arc::new(FavoritesStore::new(store));
    info!(
        "Loaded {} favorites from {}",
        favorites.ids().len(),
        config.store_path.display()
    );

    let state = AppState::new(api, favorites);
    let _superseder = state.supersede_on_change();
    let app = build_router(state);

    info!("Listening on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/home", get(home))
        .route("/api/popular", get(popular))
        .route("/api/search", get(search))
        .route("/api/movies/:id", get(movie))
        .route("/api/movies/:id/recommendations", get(recommendations))
        .route("/api/movies/:id/similar", get(similar))
        .route("/api/favorites", get(favorites))
        .route(
            "/api/favorites/:id",
            get(favorite_status).post(toggle_favorite),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn home(State(state): State<AppState>) -> Result<Json<HomePage>, PageError> {
    let ids = state.favorites.ids();
    let (trending, recommended) = tokio::join!(
        state.api.fetch_trending(),
        catalog::recommended_for(state.api.as_ref(), &ids),
    );
    let trending = trending.map_err(|e| {
        PageError::from_fetch(e, "Failed to fetch movies. Please try again later.")
    })?;
    Ok(Json(HomePage {
        trending,
        recommended,
    }))
}

async fn popular(State(state): State<AppState>) -> Result<Json<Vec<MovieSummary>>, PageError> {
    state.api.fetch_popular().await.map(Json).map_err(|e| {
        PageError::from_fetch(e, "Failed to fetch popular movies. Please try again later.")
    })
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Json<SearchPage> {
    let query = params.q.unwrap_or_default().trim().to_string();
    let results = catalog::search(state.api.as_ref(), &query).await;
    Json(SearchPage { query, results })
}

async fn movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MoviePage>, PageError> {
    let (movie, similar) = tokio::join!(
        state.api.fetch_movie(&id),
        catalog::similar_to(state.api.as_ref(), &id),
    );
    let movie = movie.map_err(|e| {
        PageError::from_fetch(e, "Failed to fetch movie details. Please try again later.")
    })?;
    let is_favorite = state.favorites.contains(movie.id());
    Ok(Json(MoviePage {
        movie,
        similar,
        is_favorite,
    }))
}

async fn recommendations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MovieSummary>>, PageError> {
    state.api.fetch_recommended(&id).await.map(Json).map_err(|e| {
        PageError::from_fetch(e, "Failed to fetch recommendations. Please try again later.")
    })
}

async fn similar(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MovieSummary>>, PageError> {
    state.api.fetch_similar(&id).await.map(Json).map_err(|e| {
        PageError::from_fetch(e, "Failed to fetch similar movies. Please try again later.")
    })
}

async fn favorites(State(state): State<AppState>) -> Json<FavoritesPage> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let ticket = state.hydration.current();
        let ids = state.favorites.ids();
        let movies = hydrate(state.api.as_ref(), &ids).await;
        if state.hydration.is_current(ticket) || attempt >= MAX_HYDRATION_ATTEMPTS {
            return Json(FavoritesPage { ids, movies });
        }
        debug!(attempt, "Favorites changed during hydration, reloading");
    }
}

async fn favorite_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!({ "is_favorite": state.favorites.contains(&id) }))
}

async fn toggle_favorite(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FavoriteToggled>, PageError> {
    let id = id.trim().to_string();
    if id.is_empty() {
        return Err(PageError {
            status: StatusCode::BAD_REQUEST,
            message: "movie id must not be empty".to_string(),
            retry: false,
        });
    }
    let ids = state.favorites.toggle(&id);
    // Anything still hydrating the old list is now stale.
    state.hydration.begin();
    let is_favorite = ids.contains(&id);
    info!(movie_id = %id, is_favorite, "Toggled favorite");
    Ok(Json(FavoriteToggled { ids, is_favorite }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
