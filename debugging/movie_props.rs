//! Fetch TMDB metadata and print the mapped records as JSON.
//! Usage:
//!   cargo run --bin movie_props -- movie <tmdb_id>
//!   cargo run --bin movie_props -- hydrate <tmdb_id> [<tmdb_id> ...]
//!   cargo run --bin movie_props -- favorites
//! Requires TMDB_API_KEY in the environment (.env supported).

use anyhow::{Context, Result};
use dotenvy::dotenv;
use moviemate::config::Config;
use moviemate::favorites::FavoritesStore;
use moviemate::hydrate::hydrate;
use moviemate::models::MovieDetails;
use moviemate::storage::FileStore;
use moviemate::tmdb::{MovieApi, TmdbClient};
use serde_json::{json, Value};
use std::env;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Movie,
    Hydrate,
    Favorites,
}

impl FromStr for Command {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "movie" => Ok(Command::Movie),
            "hydrate" => Ok(Command::Hydrate),
            "favorites" => Ok(Command::Favorites),
            _ => Err(anyhow::anyhow!(
                "command must be 'movie', 'hydrate' or 'favorites'"
            )),
        }
    }
}

fn props(movie: &MovieDetails) -> Value {
    json!({
        "id": movie.id(),
        "title": movie.summary.title,
        "year": movie.summary.release_year(),
        "runtime": movie.runtime_label(),
        "rating": movie.summary.vote_average,
        "status": movie.status,
        "language": movie.original_language.to_uppercase(),
        "budget": movie.budget,
        "revenue": movie.revenue,
        "genres": movie.genres.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
        "companies": movie
            .production_companies
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>(),
        "cast": movie
            .top_cast(8)
            .iter()
            .map(|c| json!({ "name": c.name, "character": c.character, "profile": c.profile_url() }))
            .collect::<Vec<_>>(),
        "poster": movie.summary.poster_url(),
        "backdrop": movie.summary.backdrop_url(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    let mut args = env::args().skip(1);
    let command: Command = args
        .next()
        .context("usage: movie_props <movie|hydrate|favorites> [ids...]")?
        .parse()?;
    let ids: Vec<String> = args.collect();

    let config = Config::from_env()?;
    let client = TmdbClient::from_config(&config)?;

    let output = match command {
        Command::Movie => {
            let id = ids.first().context("movie id required")?;
            let movie = client
                .fetch_movie(id)
                .await
                .with_context(|| format!("fetching movie {id}"))?;
            props(&movie)
        }
        Command::Hydrate => {
            let movies = hydrate(&client, &ids).await;
            json!({
                "requested": ids.len(),
                "loaded": movies.iter().map(props).collect::<Vec<_>>(),
            })
        }
        Command::Favorites => {
            let favorites = FavoritesStore::new(Arc::new(FileStore::open(&config.store_path)));
            let ids = favorites.load();
            let movies = hydrate(&client, &ids).await;
            json!({
                "store": config.store_path.display().to_string(),
                "ids": ids,
                "loaded": movies.iter().map(props).collect::<Vec<_>>(),
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
