//! Deeptracy Backend Client
//!
//! A small, type-safe HTTP client that delivers lifecycle signals to the
//! analysis-tracking backend.
//!
//! Signals are described by [`SignalEvent`] values (see [`analysis`] for the
//! catalogue used by the pipeline stages) and rendered against the sending
//! build's properties immediately before dispatch.
//!
//! # Example
//!
//! ```no_run
//! use deeptracy_client::{BackendClient, analysis};
//! use deeptracy_core::domain::property::{Property, PropertySet};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BackendClient::new("http://localhost:8088");
//!     let mut props = PropertySet::new().with(Property::AnalysisId, "a-1")?;
//!
//!     client.send(&analysis::extraction_started(), &mut props).await?;
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod error;
mod signals;

// Re-export commonly used types
pub use deeptracy_core::domain::signal::SignalEvent;
pub use error::{ClientError, Result};
pub use signals::SignalResult;

use reqwest::Client;

/// HTTP client for the analysis backend
#[derive(Debug, Clone)]
pub struct BackendClient {
    /// Base URL of the backend (e.g., "http://localhost:8088")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl BackendClient {
    /// Create a new backend client
    ///
    /// # Example
    /// ```
    /// use deeptracy_client::BackendClient;
    ///
    /// let client = BackendClient::new("http://localhost:8088");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new backend client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the backend
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check the status code of a response, turning failures into errors
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = BackendClient::new("http://localhost:8088");
        assert_eq!(client.base_url(), "http://localhost:8088");
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = BackendClient::new("http://localhost:8088/");
        assert_eq!(client.base_url(), "http://localhost:8088");
    }

    #[test]
    fn test_client_with_custom_client() {
        let http_client = Client::new();
        let client = BackendClient::with_client("http://localhost:8088", http_client);
        assert_eq!(client.base_url(), "http://localhost:8088");
    }
}
