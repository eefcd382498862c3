//! Spotify Web API client (client-credentials flow).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::ids::is_valid_external_id;
use super::types::{
    AlbumDetail, ArtistsResponse, CatalogArtist, Paging, SearchPage, SearchResponse,
    TokenResponse, WireAlbum, WireTrack,
};
use super::CatalogSource;
use crate::config::{Config, Credentials, MAX_PAGE_SIZE};
use crate::error::CatalogError;
use crate::retry::RetryPolicy;

/// Refresh the token when it has less than this left.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);
/// Upper bound on follow-up track pages for one album.
const MAX_TRACK_PAGES: usize = 100;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN
    }
}

/// Per-call-class timeouts used by the client.
#[derive(Debug, Clone, Copy)]
struct CallTimeouts {
    auth: Duration,
    search: Duration,
    detail: Duration,
}

pub struct SpotifyClient {
    http: Client,
    api_base: String,
    accounts_base: String,
    credentials: Credentials,
    timeouts: CallTimeouts,
    retry: RetryPolicy,
    max_retry_after: Duration,
    token: Mutex<Option<AccessToken>>,
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn send_error(e: reqwest::Error, class: &'static str, timeout: Duration) -> CatalogError {
    if e.is_timeout() {
        CatalogError::Timeout(class, timeout)
    } else {
        CatalogError::Http(e)
    }
}

impl SpotifyClient {
    pub fn new(
        credentials: Credentials,
        api_base: &str,
        accounts_base: &str,
        config: &Config,
    ) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .user_agent(concat!("catalog-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            accounts_base: accounts_base.trim_end_matches('/').to_string(),
            credentials,
            timeouts: CallTimeouts {
                auth: config.timeouts.auth(),
                search: config.timeouts.search(),
                detail: config.timeouts.detail(),
            },
            retry: RetryPolicy::new(&config.retry),
            max_retry_after: Duration::from_secs(config.retry.max_retry_after_secs),
            token: Mutex::new(None),
        })
    }

    async fn request_token(&self) -> Result<AccessToken, CatalogError> {
        let url = format!("{}/api/token", self.accounts_base);
        let timeout = self.timeouts.auth;

        let resp = self
            .retry
            .run("token request", |e: &CatalogError| e.is_transient(), || async {
                let resp = self
                    .http
                    .post(&url)
                    .basic_auth(
                        &self.credentials.client_id,
                        Some(&self.credentials.client_secret),
                    )
                    .form(&[("grant_type", "client_credentials")])
                    .timeout(timeout)
                    .send()
                    .await
                    .map_err(|e| send_error(e, "auth", timeout))?;
                if resp.status().is_server_error() {
                    return Err(CatalogError::Status {
                        status: resp.status().as_u16(),
                        url: url.clone(),
                    });
                }
                Ok(resp)
            })
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CatalogError::RateLimited {
                retry_after: retry_after(&resp),
            });
        }
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CatalogError::Auth(format!("{}: {}", status, body.trim())));
        }
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.text().await.map_err(|e| send_error(e, "auth", timeout))?;
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| CatalogError::malformed("token response", e.to_string()))?;
        let value = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CatalogError::Auth("token response without access_token".into()))?;

        debug!("Obtained catalog access token");
        Ok(AccessToken {
            value,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.unwrap_or(3600)),
        })
    }

    async fn bearer(&self) -> Result<String, CatalogError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }
        let token = self.request_token().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// GET with the retry policy applied to transient failures.
    /// The response may still carry a 4xx status, including 429.
    async fn send_get(
        &self,
        url: &str,
        class: &'static str,
        timeout: Duration,
    ) -> Result<Response, CatalogError> {
        self.retry
            .run(class, |e: &CatalogError| e.is_transient(), || async {
                let bearer = self.bearer().await?;
                let resp = self
                    .http
                    .get(url)
                    .bearer_auth(bearer)
                    .header(reqwest::header::ACCEPT, "application/json")
                    .timeout(timeout)
                    .send()
                    .await
                    .map_err(|e| send_error(e, class, timeout))?;
                if resp.status().is_server_error() {
                    return Err(CatalogError::Status {
                        status: resp.status().as_u16(),
                        url: url.to_string(),
                    });
                }
                Ok(resp)
            })
            .await
    }

    /// GET and decode JSON. A 401 drops the cached token and the request is
    /// repeated once with a fresh one. On 429 the request is repeated exactly
    /// once after the advertised pause; a second 429 surfaces `RateLimited`.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        class: &'static str,
        timeout: Duration,
    ) -> Result<T, CatalogError> {
        let mut resp = self.send_get(url, class, timeout).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!("Token rejected by {}, requesting a new one", class);
            *self.token.lock().await = None;
            resp = self.send_get(url, class, timeout).await?;
        }

        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            let wait = retry_after(&resp).unwrap_or(self.retry.base_delay);
            if wait > self.max_retry_after {
                return Err(CatalogError::RateLimited {
                    retry_after: Some(wait),
                });
            }
            warn!("Rate limited on {} - waiting {:?} before retrying once", class, wait);
            sleep(wait).await;

            resp = self.send_get(url, class, timeout).await?;
            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                return Err(CatalogError::RateLimited {
                    retry_after: retry_after(&resp),
                });
            }
        }

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(url.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            *self.token.lock().await = None;
            return Err(CatalogError::Auth(format!("token rejected by {}", class)));
        }
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = resp.text().await.map_err(|e| send_error(e, class, timeout))?;
        serde_json::from_str(&body).map_err(|e| CatalogError::malformed(class, e.to_string()))
    }
}

#[async_trait]
impl CatalogSource for SpotifyClient {
    async fn authenticate(&self) -> Result<AccessToken, CatalogError> {
        let token = self.request_token().await?;
        *self.token.lock().await = Some(token.clone());
        Ok(token)
    }

    async fn search_albums_by_label(
        &self,
        label_name: &str,
        offset: u32,
        limit: u32,
    ) -> Result<SearchPage, CatalogError> {
        let query = format!("label:\"{}\"", label_name);
        let url = format!(
            "{}/search?q={}&type=album&limit={}&offset={}",
            self.api_base,
            urlencoding::encode(&query),
            limit.clamp(1, MAX_PAGE_SIZE),
            offset
        );
        let resp: SearchResponse = self.get_json(&url, "search", self.timeouts.search).await?;
        let albums = resp
            .albums
            .ok_or_else(|| CatalogError::malformed("search", "missing albums"))?;

        let mut page = SearchPage::default();
        for item in albums.items {
            match item.map(|album| album.into_summary()) {
                Some(Ok(summary)) => page.items.push(summary),
                Some(Err(e)) => {
                    debug!("Skipping search entry at offset {}: {}", offset, e);
                    page.malformed_items.push(e.to_string());
                }
                None => page.null_items += 1,
            }
        }
        let received = page.items.len() + page.malformed_items.len();
        page.total = albums
            .total
            .unwrap_or(offset + received as u32 + page.null_items);
        Ok(page)
    }

    async fn get_album_detail(&self, external_id: &str) -> Result<AlbumDetail, CatalogError> {
        if !is_valid_external_id(external_id) {
            return Err(CatalogError::InvalidIdFormat(external_id.to_string()));
        }

        let url = format!("{}/albums/{}", self.api_base, external_id);
        let mut album: WireAlbum = self.get_json(&url, "album detail", self.timeouts.detail).await?;

        let mut extra_tracks: Vec<Option<WireTrack>> = Vec::new();
        let mut next = album.tracks.as_mut().and_then(|t| t.next.take());
        let mut pages = 0;
        while let Some(page_url) = next {
            pages += 1;
            if pages > MAX_TRACK_PAGES {
                return Err(CatalogError::malformed(
                    format!("album {}", external_id),
                    "track pagination did not terminate",
                ));
            }
            let page: Paging<Option<WireTrack>> = self
                .get_json(&page_url, "album tracks", self.timeouts.detail)
                .await?;
            extra_tracks.extend(page.items);
            next = page.next;
        }

        album.into_detail(extra_tracks)
    }

    async fn get_artists(&self, external_ids: &[String]) -> Result<Vec<CatalogArtist>, CatalogError> {
        let ids: Vec<&str> = external_ids
            .iter()
            .map(String::as_str)
            .filter(|id| is_valid_external_id(id))
            .collect();

        let mut artists = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_PAGE_SIZE as usize) {
            let url = format!("{}/artists?ids={}", self.api_base, chunk.join(","));
            let resp: ArtistsResponse = self.get_json(&url, "artists", self.timeouts.detail).await?;
            for artist in resp.artists.into_iter().flatten() {
                artists.push(artist.into_artist("artists")?);
            }
        }
        Ok(artists)
    }
}
