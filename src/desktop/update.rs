//! Release update check
//!
//! One GET against the GitHub "latest release" endpoint, comparing its tag
//! with the running version.

use semver::Version;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use crate::client::TransportError;

/// Subset of the GitHub release JSON we need
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    pub tag_name: String,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate { current: Version },
    Available { current: Version, latest: Version, url: String },
}

/// Parse a release tag such as `v1.2.3`
pub fn parse_tag(tag: &str) -> Result<Version, semver::Error> {
    let tag = tag.trim();
    Version::parse(tag.strip_prefix('v').unwrap_or(tag))
}

/// Compare the running version against the latest release
pub fn compare(current: &str, release: &ReleaseInfo, releases_url: &str) -> Result<UpdateStatus, TransportError> {
    let current = parse_tag(current).map_err(|e| TransportError::InvalidResponse(format!("bad current version: {}", e)))?;
    let latest = parse_tag(&release.tag_name)
        .map_err(|e| TransportError::InvalidResponse(format!("bad release tag {:?}: {}", release.tag_name, e)))?;

    if latest > current {
        let url = release
            .html_url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| releases_url.to_string());
        Ok(UpdateStatus::Available { current, latest, url })
    } else {
        Ok(UpdateStatus::UpToDate { current })
    }
}

pub async fn fetch_latest(update_url: &str) -> Result<ReleaseInfo, TransportError> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("snap2latex/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(15))
        .build()?;
    let resp = client
        .get(update_url)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(TransportError::UnexpectedStatus {
            status: resp.status().as_u16(),
        });
    }
    Ok(resp.json().await?)
}

/// Blocking update check for a background thread
pub fn check_for_updates(update_url: &str, releases_url: &str) -> Result<UpdateStatus, TransportError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TransportError::InvalidResponse(format!("failed to start runtime: {}", e)))?;
    let release = rt.block_on(fetch_latest(update_url))?;
    let status = compare(env!("CARGO_PKG_VERSION"), &release, releases_url)?;
    info!("Update check: latest release is {}", release.tag_name);
    Ok(status)
}
