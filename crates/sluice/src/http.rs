//! HTTP client construction from [`HttpConfig`].

use std::time::Duration;

use reqwest::Client;
use reqwest::redirect::Policy;

use crate::config::HttpConfig;
use crate::error::{DownloadError, Result};

/// Builds the shared reqwest client used for manifest and segment requests.
pub fn create_client(config: &HttpConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .redirect(if config.follow_redirects {
            Policy::limited(10)
        } else {
            Policy::none()
        });

    if config.timeout > Duration::ZERO {
        builder = builder.timeout(config.timeout);
    }

    builder.build().map_err(|e| DownloadError::Configuration {
        reason: format!("failed to build HTTP client: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_client_with_defaults() {
        let client = create_client(&HttpConfig::default());
        assert!(client.is_ok());
    }
}
