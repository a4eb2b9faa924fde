//! Product user agent sent with every outbound request.

/// `<product>/<version>`, taken from the package metadata at build time.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build the headers shared by every outbound webhook request.
pub fn build_headers(attempt: u32) -> Vec<(String, String)> {
    vec![
        ("User-Agent".to_string(), USER_AGENT.to_string()),
        ("X-Webhook-Attempt".to_string(), attempt.to_string()),
    ]
}
