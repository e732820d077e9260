//! M-Lab name-server client.
//!
//! mlab-ns answers with the single NDT server closest to the caller.

use serde::Deserialize;
use tracing::debug;

use crate::error::{NdtError, Result};
use crate::params;

/// An NDT server returned by mlab-ns.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Server {
    /// FQDN of the server machine.
    pub fqdn: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    /// M-Lab site code, e.g. `lga06`.
    #[serde(default)]
    pub site: String,
    /// Legacy HTTP URL of the NDT service.
    pub url: Option<String>,
    /// Addresses of the server, IPv4 and IPv6.
    #[serde(default)]
    pub ip: Vec<String>,
}

impl Server {
    /// Metro code: the first three letters of the site.
    pub fn metro(&self) -> &str {
        self.site.get(..3).unwrap_or(&self.site)
    }
}

/// Query mlab-ns for the nearest NDT server.
///
/// Returns [`NdtError::NoTargets`] when mlab-ns responds with 204.
pub async fn nearest(user_agent: &str) -> Result<Server> {
    let client = reqwest::Client::builder().user_agent(user_agent).build()?;
    let response = client
        .get(params::MLAB_NS_URL)
        .send()
        .await?
        .error_for_status()?;

    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Err(NdtError::NoTargets);
    }

    let server: Server = response.json().await?;
    debug!(fqdn = %server.fqdn, site = %server.site, "located NDT server");
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_mlab_ns_response() {
        let json = r#"{
            "city": "New York_NY",
            "url": "http://ndt.iupui.mlab1.lga06.measurement-lab.org:7123",
            "ip": ["4.35.238.194", "2001:1890:1001:2101::194"],
            "fqdn": "ndt.iupui.mlab1.lga06.measurement-lab.org",
            "site": "lga06",
            "country": "US"
        }"#;

        let server: Server = serde_json::from_str(json).unwrap();

        assert_eq!(server.fqdn, "ndt.iupui.mlab1.lga06.measurement-lab.org");
        assert_eq!(server.metro(), "lga");
        assert_eq!(server.ip.len(), 2);
    }

    #[test]
    fn sparse_response_still_parses() {
        let server: Server = serde_json::from_str(r#"{"fqdn": "ndt.example.net"}"#).unwrap();
        assert_eq!(server.metro(), "");
        assert!(server.url.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_nearest_real_api() {
        let server = nearest("ndt-client-rust/test").await.unwrap();
        assert!(!server.fqdn.is_empty());
    }
}
