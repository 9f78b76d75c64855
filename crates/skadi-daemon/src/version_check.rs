//! Start-up check against the latest published release.

use std::time::Duration;

use skadi_proto::config::VersionConfig;
use skadi_proto::version::{compare_versions, ReleaseResponse, RemoteVersionResult, VersionCompare};
use tracing::{error, info};

use crate::status::StatusSink;

pub const LOCAL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn fetch_latest(client: &reqwest::Client, url: &str) -> anyhow::Result<RemoteVersionResult> {
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let release: ReleaseResponse = response.json().await?;
    Ok(release.into())
}

pub fn describe(compare: VersionCompare, local: &str, remote: &str) -> String {
    match compare {
        VersionCompare::LocalIsLatest => "This is the latest version.".to_string(),
        VersionCompare::LocalIsOlder => format!("{} is available", remote),
        VersionCompare::LocalIsNewer => format!(
            "This version ({}) is newer than the latest public release version ({}) - use with caution",
            local, remote
        ),
    }
}

/// Fetch, compare and report the outcome to the status sink.  Failures are
/// only logged.
pub async fn run(config: VersionConfig, status: StatusSink) {
    if !config.check_enabled {
        return;
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent(concat!("skadi/", env!("CARGO_PKG_VERSION")))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!("could not complete version check: {}", e);
            return;
        }
    };

    let remote = match fetch_latest(&client, &config.releases_url).await {
        Ok(r) => r,
        Err(e) => {
            error!("could not complete version check: {:#}", e);
            return;
        }
    };

    match compare_versions(LOCAL_VERSION, &remote.version) {
        Some(compare) => {
            info!("Version check: local {} remote {}", LOCAL_VERSION, remote.version);
            status.update(describe(compare, LOCAL_VERSION, &remote.version));
            if compare == VersionCompare::LocalIsOlder {
                status.update(format!("download: {}", remote.download_url));
            }
        }
        None => error!(
            "could not complete version check: cannot compare {} with {}",
            LOCAL_VERSION, remote.version
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(VersionCompare::LocalIsLatest, "1.0.0", "v1.0.0"),
            "This is the latest version."
        );
        assert_eq!(
            describe(VersionCompare::LocalIsOlder, "1.0.0", "v1.1.0"),
            "v1.1.0 is available"
        );
        assert_eq!(
            describe(VersionCompare::LocalIsNewer, "2.0.0", "v1.1.0"),
            "This version (2.0.0) is newer than the latest public release version (v1.1.0) - use with caution"
        );
    }

    #[tokio::test]
    async fn test_run_reports_newer_release() {
        let app = Router::new().route(
            "/latest",
            get(|| async {
                Json(serde_json::json!({
                    "tag_name": "v999.0.0",
                    "html_url": "https://example.org/releases/v999.0.0",
                    "body": "everything",
                    "assets": [{"browser_download_url": "https://example.org/skadi.tar.gz", "size": 10}]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (status, mut rx) = StatusSink::channel();
        run(
            VersionConfig {
                check_enabled: true,
                releases_url: format!("http://{}/latest", addr),
            },
            status,
        )
        .await;

        assert_eq!(rx.recv().await.unwrap(), "v999.0.0 is available");
        assert_eq!(
            rx.recv().await.unwrap(),
            "download: https://example.org/skadi.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_disabled_check_reports_nothing() {
        let (status, mut rx) = StatusSink::channel();
        run(
            VersionConfig {
                check_enabled: false,
                releases_url: "http://127.0.0.1:9/latest".to_string(),
            },
            status,
        )
        .await;
        assert!(rx.recv().await.is_none());
    }
}
