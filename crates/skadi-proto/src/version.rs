//! Release version comparison for the start-up update check.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Latest published release as reported by the releases API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVersionResult {
    pub version: String,
    pub download_url: String,
    pub changelog: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCompare {
    LocalIsLatest,
    LocalIsNewer,
    LocalIsOlder,
}

/// Raw shape of a GitHub-style "latest release" response.
#[derive(Debug, Deserialize)]
pub struct ReleaseResponse {
    pub tag_name: String,
    pub html_url: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseAsset {
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl From<ReleaseResponse> for RemoteVersionResult {
    fn from(release: ReleaseResponse) -> Self {
        let asset = release.assets.first();
        Self {
            version: release.tag_name,
            download_url: asset
                .map(|a| a.browser_download_url.clone())
                .unwrap_or(release.html_url),
            changelog: release.body.unwrap_or_default(),
            size: asset.map(|a| a.size).unwrap_or(0),
        }
    }
}

/// Numeric components of `v1.2.3-beta` style versions; qualifiers are ignored.
fn components(version: &str) -> Option<Vec<u64>> {
    let core = version
        .trim()
        .trim_start_matches(['v', 'V'])
        .split(['-', '+'])
        .next()?;
    if core.is_empty() {
        return None;
    }
    core.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// Compare the running version with the remote one.  `None` if either string
/// is not a dotted numeric version.
pub fn compare_versions(local: &str, remote: &str) -> Option<VersionCompare> {
    let mut local = components(local)?;
    let mut remote = components(remote)?;
    let len = local.len().max(remote.len());
    local.resize(len, 0);
    remote.resize(len, 0);

    Some(match local.cmp(&remote) {
        Ordering::Equal => VersionCompare::LocalIsLatest,
        Ordering::Greater => VersionCompare::LocalIsNewer,
        Ordering::Less => VersionCompare::LocalIsOlder,
    })
}
