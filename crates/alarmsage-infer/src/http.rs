//! Response/error helpers shared by the HTTP providers.

use std::time::Duration;

use alarmsage_core::Error;

/// `Retry-After` given in seconds, if present and parseable.
pub fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Turn a non-success response into the matching error variant.
pub async fn status_error(service: &str, response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let hint = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    Error::from_http_status(service, status, hint, truncate(&body, 500))
}

pub fn transport_error(service: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            operation: format!("{} request", service),
            elapsed: Duration::ZERO,
        }
    } else {
        Error::upstream(service, e)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("äöü", 2), "äö");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
