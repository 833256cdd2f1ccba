use anyhow::{Context, Result};

/// Build the shared outbound client. System proxy discovery is opt-in via
/// `GAOD_ENABLE_SYSTEM_PROXY`; without it every request goes direct.
pub fn build_http_client() -> Result<reqwest::Client> {
    let allow_system_proxy = std::env::var("GAOD_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(false) {
            Ok(client) => return Ok(client),
            Err(error) => tracing::warn!(
                "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                error
            ),
        }
    }

    attempt_build(true).context("Failed to initialize HTTP client")
}

fn attempt_build(no_proxy: bool) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_client_builds() {
        assert!(attempt_build(true).is_ok());
    }
}
