use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// Abstraction over blocking HTTP GETs (version manifest, firmware image).
/// This allows mocking the network in tests.
#[cfg_attr(test, automock)]
pub trait HttpClient {
    /// Fetch a UTF-8 text resource.
    fn get_text(&self, url: &str) -> Result<String, String>;

    /// Fetch a binary resource.
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, String>;
}

/// Real implementation backed by a blocking reqwest client.
pub struct ReqwestHttpClient {
    client: reqwest::blocking::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("crow-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, String> {
        self.client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| format!("GET {} failed: {}", url, e))
    }
}

impl HttpClient for ReqwestHttpClient {
    fn get_text(&self, url: &str) -> Result<String, String> {
        self.get(url)?
            .text()
            .map_err(|e| format!("Failed to read response body: {}", e))
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, String> {
        let bytes = self
            .get(url)?
            .bytes()
            .map_err(|e| format!("Failed to read response body: {}", e))?;

        Ok(bytes.to_vec())
    }
}
