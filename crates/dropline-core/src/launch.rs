//! Out-of-band connect links
//!
//! A remote identity can be handed over as a `connect` query parameter, for
//! example through a scanned QR code. The parameter is consumed once: the
//! caller gets the identity plus the URL with the parameter stripped, to put
//! back in the address bar so a reload does not connect again.

use crate::types::SessionIdentity;
use crate::{DroplineError, DroplineResult};
use url::Url;

/// Query parameter carrying the remote identity
pub const CONNECT_PARAM: &str = "connect";

/// Page that forwards a scanned link to the client
pub const SCAN_PAGE: &str = "scan.html";

/// Result of inspecting a launch URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Remote to connect to once the local identity is ready
    pub remote: Option<SessionIdentity>,
    /// The URL without the `connect` parameter
    pub cleaned: String,
}

impl LaunchRequest {
    /// Inspect a launch URL
    ///
    /// Other query parameters are kept. A blank `connect` value is dropped
    /// without yielding a remote.
    pub fn parse(raw: &str) -> DroplineResult<Self> {
        let mut url = Url::parse(raw)
            .map_err(|e| DroplineError::config_error(format!("invalid launch URL: {}", e)))?;

        let mut remote = None;
        let mut kept = Vec::new();
        for (key, value) in url.query_pairs() {
            if key == CONNECT_PARAM {
                if remote.is_none() {
                    remote = SessionIdentity::parse(&value).ok();
                }
            } else {
                kept.push((key.into_owned(), value.into_owned()));
            }
        }

        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }

        Ok(Self {
            remote,
            cleaned: url.to_string(),
        })
    }

    /// Whether the URL asked for a connection
    pub fn wants_connect(&self) -> bool {
        self.remote.is_some()
    }
}

/// Link a remote device opens to connect to `identity`
///
/// The scan page lives next to the page at `base`; any query or fragment on
/// `base` is discarded.
pub fn share_link(base: &str, identity: &SessionIdentity) -> DroplineResult<String> {
    let mut base = Url::parse(base)
        .map_err(|e| DroplineError::config_error(format!("invalid base URL: {}", e)))?;
    base.set_query(None);
    base.set_fragment(None);

    let mut link = base
        .join(SCAN_PAGE)
        .map_err(|e| DroplineError::config_error(format!("invalid base URL: {}", e)))?;
    link.query_pairs_mut()
        .append_pair(CONNECT_PARAM, identity.as_str());
    Ok(link.to_string())
}
