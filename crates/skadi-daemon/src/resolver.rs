//! Stream quality resolution against the remote platform.
//!
//! Two sequential calls: an access token for the channel, then the variant
//! playlist signed with it.  The pair is attempted up to `MAX_ATTEMPTS` times
//! back to back; exhaustion yields `None`.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use skadi_proto::channel::{Channel, StreamQuality};
use skadi_proto::config::RemoteConfig;
use skadi_proto::playlist::parse_variant_playlist;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const MAX_ATTEMPTS: usize = 5;

/// Signed access token for one channel's playlist.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub sig: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned status {status}")]
    Status {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("invalid playlist: {0:#}")]
    Playlist(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct QualityResolver {
    client: reqwest::Client,
    remote: RemoteConfig,
}

impl QualityResolver {
    pub fn new(remote: RemoteConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(client_id) = remote.client_id.as_deref() {
            headers.insert(
                HeaderName::from_static("client-id"),
                HeaderValue::from_str(client_id)?,
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(remote.request_timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self { client, remote })
    }

    /// Resolve the playable qualities of `channel`.  `None` once every attempt
    /// has failed.
    pub async fn resolve(&self, channel: &Channel) -> Option<Vec<StreamQuality>> {
        self.resolve_cancellable(channel, &CancellationToken::new())
            .await
    }

    /// Like `resolve`, but stops before the next attempt once `cancel` fires.
    pub async fn resolve_cancellable(
        &self,
        channel: &Channel,
        cancel: &CancellationToken,
    ) -> Option<Vec<StreamQuality>> {
        for attempt in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                debug!("Quality resolution for {} cancelled", channel);
                return None;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Quality resolution for {} cancelled", channel);
                    return None;
                }
                result = self.try_resolve(channel) => result,
            };

            match result {
                Ok(qualities) => {
                    info!(
                        "Resolved {} qualities for {} on attempt {}",
                        qualities.len(),
                        channel,
                        attempt
                    );
                    return Some(qualities);
                }
                Err(e) => {
                    error!(
                        "failed to retrieve stream qualities for {} (attempt {}/{}): {}",
                        channel, attempt, MAX_ATTEMPTS, e
                    );
                }
            }
        }
        None
    }

    async fn try_resolve(&self, channel: &Channel) -> Result<Vec<StreamQuality>, ResolveError> {
        let token = self.fetch_token(channel).await?;
        let playlist = self.fetch_playlist(channel, &token).await?;
        parse_variant_playlist(&playlist).map_err(ResolveError::Playlist)
    }

    async fn fetch_token(&self, channel: &Channel) -> Result<AccessToken, ResolveError> {
        let url = format!(
            "{}/api/channels/{}/access_token",
            self.remote.api_base.trim_end_matches('/'),
            channel.api_name()
        );
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ResolveError::Status {
                endpoint: "token endpoint",
                status: response.status(),
            });
        }
        Ok(response.json().await?)
    }

    async fn fetch_playlist(
        &self,
        channel: &Channel,
        token: &AccessToken,
    ) -> Result<String, ResolveError> {
        let url = format!(
            "{}/api/channel/hls/{}.m3u8",
            self.remote.usher_base.trim_end_matches('/'),
            channel.api_name()
        );
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("sig", token.sig.as_str()),
                ("token", token.token.as_str()),
                ("allow_source", "true"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ResolveError::Status {
                endpoint: "manifest endpoint",
                status: response.status(),
            });
        }
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID=\"chunked\",NAME=\"1080p60 (source)\",AUTOSELECT=YES\n\
#EXT-X-STREAM-INF:BANDWIDTH=8533624,VIDEO=\"chunked\"\n\
https://video.example/chunked.m3u8\n\
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID=\"720p60\",NAME=\"720p60\",AUTOSELECT=YES\n\
#EXT-X-STREAM-INF:BANDWIDTH=3422999,VIDEO=\"720p60\"\n\
https://video.example/720p60.m3u8\n";

    /// Token and manifest requests fail until their counters pass the given
    /// thresholds.
    #[derive(Default)]
    struct FakeRemote {
        token_hits: AtomicUsize,
        manifest_hits: AtomicUsize,
        token_failures: usize,
        manifest_failures: usize,
        last_query: std::sync::Mutex<Option<(String, HashMap<String, String>)>>,
    }

    async fn token(
        State(remote): State<Arc<FakeRemote>>,
        Path(_name): Path<String>,
    ) -> Result<Json<serde_json::Value>, StatusCode> {
        let hit = remote.token_hits.fetch_add(1, Ordering::SeqCst);
        if hit < remote.token_failures {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Ok(Json(serde_json::json!({
            "token": "{\"channel\":\"examplechannel\",\"expires\":1}",
            "sig": "abc123"
        })))
    }

    async fn manifest(
        State(remote): State<Arc<FakeRemote>>,
        Path(file): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Result<String, StatusCode> {
        let hit = remote.manifest_hits.fetch_add(1, Ordering::SeqCst);
        *remote.last_query.lock().unwrap() = Some((file, query));
        if hit < remote.manifest_failures {
            return Err(StatusCode::BAD_GATEWAY);
        }
        Ok(PLAYLIST.to_string())
    }

    async fn spawn_remote(remote: Arc<FakeRemote>) -> RemoteConfig {
        let app = Router::new()
            .route("/api/channels/:name/access_token", get(token))
            .route("/api/channel/hls/:file", get(manifest))
            .with_state(remote);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let base = format!("http://{}", addr);
        RemoteConfig {
            api_base: base.clone(),
            usher_base: base,
            client_id: Some("test-client".to_string()),
            request_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_always_failing_remote_is_tried_exactly_five_times() {
        let remote = Arc::new(FakeRemote {
            token_failures: usize::MAX,
            ..FakeRemote::default()
        });
        let resolver = QualityResolver::new(spawn_remote(remote.clone()).await).unwrap();

        let result = resolver.resolve(&Channel::new("ExampleChannel")).await;

        assert!(result.is_none());
        assert_eq!(remote.token_hits.load(Ordering::SeqCst), MAX_ATTEMPTS);
        assert_eq!(remote.manifest_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flaky_manifest_recovers_within_bound() {
        let remote = Arc::new(FakeRemote {
            manifest_failures: 2,
            ..FakeRemote::default()
        });
        let resolver = QualityResolver::new(spawn_remote(remote.clone()).await).unwrap();

        let qualities = resolver
            .resolve(&Channel::new("ExampleChannel"))
            .await
            .expect("third attempt should succeed");

        assert_eq!(remote.token_hits.load(Ordering::SeqCst), 3);
        assert_eq!(remote.manifest_hits.load(Ordering::SeqCst), 3);
        let tokens: Vec<&str> = qualities.iter().map(|q| q.quality.as_str()).collect();
        assert_eq!(tokens, vec!["best", "source", "720p60", "worst"]);
    }

    #[tokio::test]
    async fn test_manifest_request_carries_signed_token() {
        let remote = Arc::new(FakeRemote::default());
        let resolver = QualityResolver::new(spawn_remote(remote.clone()).await).unwrap();

        resolver
            .resolve(&Channel::new("ExampleChannel"))
            .await
            .expect("should resolve");

        let (file, query) = remote.last_query.lock().unwrap().clone().unwrap();
        assert_eq!(file, "examplechannel.m3u8");
        assert_eq!(query.get("sig").map(String::as_str), Some("abc123"));
        assert_eq!(
            query.get("token").map(String::as_str),
            Some("{\"channel\":\"examplechannel\",\"expires\":1}")
        );
        assert_eq!(query.get("allow_source").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_cancelled_resolution_makes_no_requests() {
        let remote = Arc::new(FakeRemote::default());
        let resolver = QualityResolver::new(spawn_remote(remote.clone()).await).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = resolver
            .resolve_cancellable(&Channel::new("examplechannel"), &cancel)
            .await;

        assert!(result.is_none());
        assert_eq!(remote.token_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_remote_yields_none() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let base = format!("http://{}", addr);
        let resolver = QualityResolver::new(RemoteConfig {
            api_base: base.clone(),
            usher_base: base,
            client_id: None,
            request_timeout_secs: 2,
        })
        .unwrap();

        assert!(resolver.resolve(&Channel::new("examplechannel")).await.is_none());
    }
}
