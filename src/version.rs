//! Remote manifest and local version resolution.
//!
//! The manifest is one line of text: `<version> <download-url>`. The local
//! version is whatever crow puts between quotes in reply to `^^v`.

use std::fmt;

use tracing::{debug, info};

use crate::error::{UpdateError, UpdateResult};
use crate::serial::{CrowCommand, DeviceSession, READ_ALL, VERSION_READ_LIMIT};
use crate::traits::HttpClient;

/// Local version used when no crow answered on the serial bus.
pub const SENTINEL_VERSION: &str = "0";

/// Opaque version token, ordered lexicographically.
///
/// `"10.0" < "2.0"` under this ordering. That is what crow releases have
/// always been compared with, so it is kept as is.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionString(String);

impl VersionString {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The "device absent, force update" marker.
    pub fn sentinel() -> Self {
        Self(SENTINEL_VERSION.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL_VERSION
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed remote version manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareManifest {
    pub version: VersionString,
    pub download_url: String,
}

/// Split a manifest into its version and download URL.
///
/// Extra trailing tokens are ignored.
pub fn parse_manifest(text: &str) -> UpdateResult<FirmwareManifest> {
    let mut tokens = text.split_whitespace();

    let version = tokens.next().ok_or_else(|| UpdateError::ManifestParse {
        reason: "manifest is empty".to_string(),
    })?;
    let download_url = tokens.next().ok_or_else(|| UpdateError::ManifestParse {
        reason: format!("no download URL after version {:?}", version),
    })?;

    Ok(FirmwareManifest {
        version: VersionString::new(version),
        download_url: download_url.to_string(),
    })
}

/// True iff `local` sorts at or after `remote`.
///
/// The sentinel is compared like any other string; callers decide what it
/// means before asking.
pub fn is_up_to_date(local: &VersionString, remote: &VersionString) -> bool {
    local >= remote
}

/// Pull the version out of a `^^v` reply such as `^^version('v3.0.1')`.
pub fn extract_version(response: &str) -> UpdateResult<VersionString> {
    let mut parts = response.split('\'');
    let quoted = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(inner), Some(_)) => inner,
        _ => {
            return Err(UpdateError::VersionParse {
                response: response.to_string(),
            })
        }
    };

    let version = quoted.strip_prefix('v').unwrap_or(quoted);
    if version.is_empty() {
        return Err(UpdateError::VersionParse {
            response: response.to_string(),
        });
    }

    Ok(VersionString::new(version))
}

/// Resolves the remote and local firmware versions.
pub struct VersionResolver<'a> {
    http: &'a dyn HttpClient,
}

impl<'a> VersionResolver<'a> {
    pub fn new(http: &'a dyn HttpClient) -> Self {
        Self { http }
    }

    /// Fetch the manifest text.
    pub fn fetch_manifest(&self, url: &str) -> UpdateResult<String> {
        debug!(url, "fetching version manifest");
        self.http
            .get_text(url)
            .map_err(|reason| UpdateError::ManifestFetch {
                url: url.to_string(),
                reason,
            })
    }

    /// Fetch and parse the manifest.
    pub fn resolve_remote(&self, url: &str) -> UpdateResult<FirmwareManifest> {
        let manifest = parse_manifest(&self.fetch_manifest(url)?)?;
        info!(version = %manifest.version, "remote firmware version");
        Ok(manifest)
    }

    /// Ask a connected crow for its firmware version.
    ///
    /// Any running script is cleared first so its output doesn't get mixed
    /// into the version reply.
    pub fn read_local_version(session: &mut DeviceSession) -> UpdateResult<VersionString> {
        let cleared = session.send_and_wait(CrowCommand::ClearScript, READ_ALL)?;
        debug!(bytes = cleared.len(), "discarded output after clearing script");

        Self::query_version(session)
    }

    /// Send `^^v` alone. A running script keeps running, and anything it
    /// prints can end up ahead of the reply.
    pub fn query_version(session: &mut DeviceSession) -> UpdateResult<VersionString> {
        let reply = session.send_and_wait(CrowCommand::Version, VERSION_READ_LIMIT)?;
        let version = extract_version(&reply)?;
        info!(version = %version, "local firmware version");
        Ok(version)
    }
}
