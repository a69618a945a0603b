use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{FetchError, FetchResult};
use crate::models::{MovieDetails, MovieSummary, Page};

/// Metadata capability the listing, detail and favorites views are built on.
#[async_trait]
pub trait MovieApi: Send + Sync {
    async fn fetch_movie(&self, id: &str) -> FetchResult<MovieDetails>;
    async fn fetch_trending(&self) -> FetchResult<Vec<MovieSummary>>;
    async fn fetch_popular(&self) -> FetchResult<Vec<MovieSummary>>;
    async fn fetch_recommended(&self, id: &str) -> FetchResult<Vec<MovieSummary>>;
    async fn fetch_similar(&self, id: &str) -> FetchResult<Vec<MovieSummary>>;
    async fn search(&self, query: &str) -> FetchResult<Vec<MovieSummary>>;
}

#[derive(Debug, Clone)]
pub struct TmdbClient {
    client: Client,
    api_key: String,
    base_url: String,
    language: String,
}

impl TmdbClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_base(
            config.tmdb_api_key.clone(),
            &config.tmdb_base_url,
            &config.tmdb_language,
        )
    }

    pub fn with_base(api_key: impl Into<String>, base_url: &str, language: &str) -> Result<Self> {
        let user_agent = format!("moviemate/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .user_agent(user_agent)
            .build()
            .context("Failed to build TMDB HTTP client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            language: language.to_string(),
        })
    }

    fn url(&self, path: &str, extra: &[(&str, &str)]) -> String {
        let mut url = format!(
            "{}{path}?api_key={}&language={}",
            self.base_url,
            urlencoding::encode(&self.api_key),
            urlencoding::encode(&self.language)
        );
        for (k, v) in extra {
            url.push('&');
            url.push_str(k);
            url.push('=');
            url.push_str(&urlencoding::encode(v));
        }
        url
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        extra: &[(&str, &str)],
    ) -> FetchResult<T> {
        let url = self.url(path, extra);
        debug!(path = %path, "Fetching from TMDB");
        let res = self.client.get(&url).send().await?;
        let status = res.status();
        let text = res.text().await?;
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            warn!(path = %path, status = status.as_u16(), "TMDB request failed");
            return Err(FetchError::Status {
                status: status.as_u16(),
                path: path.to_string(),
                body: text,
            });
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn listing(&self, path: &str, extra: &[(&str, &str)]) -> FetchResult<Vec<MovieSummary>> {
        let page: Page<MovieSummary> = self.get_json(path, extra).await?;
        Ok(page.results)
    }
}

#[async_trait]
impl MovieApi for TmdbClient {
    async fn fetch_movie(&self, id: &str) -> FetchResult<MovieDetails> {
        let id = parse_movie_id(id)?;
        let path = format!("/movie/{id}");
        let details: MovieDetails = self
            .get_json(&path, &[("append_to_response", "credits")])
            .await?;
        if details.id().is_empty() || details.id() == "0" {
            return Err(FetchError::Malformed(format!(
                "movie {id} response has no id"
            )));
        }
        Ok(details)
    }

    async fn fetch_trending(&self) -> FetchResult<Vec<MovieSummary>> {
        self.listing("/trending/movie/week", &[]).await
    }

    async fn fetch_popular(&self) -> FetchResult<Vec<MovieSummary>> {
        self.listing("/movie/popular", &[]).await
    }

    async fn fetch_recommended(&self, id: &str) -> FetchResult<Vec<MovieSummary>> {
        let id = parse_movie_id(id)?;
        self.listing(&format!("/movie/{id}/recommendations"), &[])
            .await
    }

    async fn fetch_similar(&self, id: &str) -> FetchResult<Vec<MovieSummary>> {
        let id = parse_movie_id(id)?;
        self.listing(&format!("/movie/{id}/similar"), &[]).await
    }

    async fn search(&self, query: &str) -> FetchResult<Vec<MovieSummary>> {
        self.listing("/search/movie", &[("query", query)]).await
    }
}

/// TMDB movie ids are positive integers; anything else would build a bogus path.
pub fn parse_movie_id(input: &str) -> FetchResult<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(FetchError::InvalidId(input.to_string()));
    }
    match trimmed.parse::<u64>() {
        Ok(0) | Err(_) => Err(FetchError::InvalidId(input.to_string())),
        Ok(id) => Ok(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_only_positive_numeric_ids() {
        assert_eq!(parse_movie_id("27205").ok(), Some(27205));
        assert_eq!(parse_movie_id(" 157336 ").ok(), Some(157336));
        assert!(matches!(parse_movie_id(""), Err(FetchError::InvalidId(_))));
        assert!(matches!(parse_movie_id("0"), Err(FetchError::InvalidId(_))));
        assert!(matches!(
            parse_movie_id("../tv/1"),
            Err(FetchError::InvalidId(_))
        ));
        assert!(matches!(parse_movie_id("tt123"), Err(FetchError::InvalidId(_))));
    }

    #[test]
    fn builds_urls_with_key_language_and_encoded_params() {
        let client = TmdbClient::with_base("k e y", "https://example.test/3/", "en-US")
            .expect("client builds");
        let url = client.url("/search/movie", &[("query", "the matrix & co")]);
        assert_eq!(
            url,
            "https://example.test/3/search/movie?api_key=k%20e%20y&language=en-US&query=the%20matrix%20%26%20co"
        );
    }

    #[test]
    fn listing_page_tolerates_missing_results() {
        let page: Page<MovieSummary> =
            serde_json::from_value(json!({ "page": 1 })).expect("page deserialize");
        assert!(page.results.is_empty());
    }
}
