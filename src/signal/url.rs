//! Deterministic construction of signal and validate URLs.
//!
//! Callers hand the SDK an HTTP(S) or WS(S) base URL; the signal endpoint is
//! always a websocket URL ending in an `rtc` segment and the validate probe
//! is its HTTP twin ending in `validate`. Secure schemes stay secure.

use url::Url;

use crate::error::{Result, RoomWireError};
use crate::protocol::{PROTOCOL_VERSION, SDK_IDENTIFIER};

/// Parse and sanity-check a user-supplied base URL.
pub fn parse_base_url(input: &str) -> Result<Url> {
    let url =
        Url::parse(input).map_err(|e| RoomWireError::Connect(format!("invalid url: {e}")))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(url),
        other => Err(RoomWireError::Connect(format!(
            "unsupported url scheme: {other}"
        ))),
    }
}

/// Build the websocket URL the signal client dials.
///
/// `reconnect` appends `reconnect=1`, telling the server to resume the
/// existing session instead of performing a join handshake.
pub fn build_signal_url(
    base: &Url,
    token: &str,
    auto_subscribe: bool,
    reconnect: bool,
) -> Result<Url> {
    let scheme = if is_secure(base) { "wss" } else { "ws" };
    let mut url = with_endpoint(base, scheme, "rtc")?;
    apply_query(&mut url, token, auto_subscribe, reconnect);
    Ok(url)
}

/// Build the HTTP URL of the validate probe matching [`build_signal_url`].
pub fn build_validate_url(base: &Url, token: &str, auto_subscribe: bool) -> Result<Url> {
    let scheme = if is_secure(base) { "https" } else { "http" };
    let mut url = with_endpoint(base, scheme, "validate")?;
    apply_query(&mut url, token, auto_subscribe, false);
    Ok(url)
}

fn is_secure(url: &Url) -> bool {
    matches!(url.scheme(), "https" | "wss")
}

/// Swap the scheme and replace the final path segment with `endpoint`.
///
/// A trailing `rtc` or `validate` segment on a non-directory path is
/// stripped first, so base URLs that already point at either endpoint
/// rebuild cleanly.
fn with_endpoint(base: &Url, scheme: &str, endpoint: &str) -> Result<Url> {
    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| RoomWireError::Connect(format!("cannot derive {scheme} url from {base}")))?;

    let is_directory = base.path().ends_with('/');
    let mut segments: Vec<String> = base
        .path_segments()
        .map(|parts| {
            parts
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    if !is_directory {
        if let Some(last) = segments.last() {
            if last == "rtc" || last == "validate" {
                segments.pop();
            }
        }
    }
    segments.push(endpoint.to_owned());

    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| RoomWireError::Connect(format!("url cannot be a base: {base}")))?;
        path.clear();
        for segment in &segments {
            path.push(segment);
        }
    }
    url.set_query(None);
    Ok(url)
}

fn apply_query(url: &mut Url, token: &str, auto_subscribe: bool, reconnect: bool) {
    let mut pairs = url.query_pairs_mut();
    pairs.append_pair("access_token", token);
    pairs.append_pair("protocol", &PROTOCOL_VERSION.to_string());
    pairs.append_pair("sdk", SDK_IDENTIFIER);
    pairs.append_pair("version", env!("CARGO_PKG_VERSION"));
    if auto_subscribe {
        pairs.append_pair("auto_subscribe", "1");
    }
    if reconnect {
        pairs.append_pair("reconnect", "1");
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn query(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn https_base_becomes_wss_rtc() {
        let base = parse_base_url("https://rw.example.com").unwrap();
        let url = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/rtc");
    }

    #[test]
    fn http_base_becomes_ws() {
        let base = parse_base_url("http://localhost:7880").unwrap();
        let url = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/rtc");
    }

    #[test]
    fn existing_rtc_segment_is_not_doubled() {
        let base = parse_base_url("https://rw.example.com/rtc").unwrap();
        let url = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(url.path(), "/rtc");
    }

    #[test]
    fn existing_validate_segment_is_replaced() {
        let base = parse_base_url("https://rw.example.com/validate").unwrap();
        let url = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(url.path(), "/rtc");
    }

    #[test]
    fn directory_paths_keep_all_segments() {
        let base = parse_base_url("https://rw.example.com/tenant/a/").unwrap();
        let url = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(url.path(), "/tenant/a/rtc");
    }

    #[test]
    fn non_endpoint_segment_is_preserved() {
        let base = parse_base_url("wss://rw.example.com/tenant").unwrap();
        let url = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/tenant/rtc");
    }

    #[test]
    fn query_carries_token_and_protocol_metadata() {
        let base = parse_base_url("https://rw.example.com").unwrap();
        let url = build_signal_url(&base, "secret-token", true, false).unwrap();
        assert_eq!(query(&url, "access_token").unwrap(), "secret-token");
        assert_eq!(
            query(&url, "protocol").unwrap(),
            PROTOCOL_VERSION.to_string()
        );
        assert_eq!(query(&url, "sdk").unwrap(), SDK_IDENTIFIER);
        assert_eq!(query(&url, "version").unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn reconnect_flag_only_when_resuming() {
        let base = parse_base_url("https://rw.example.com").unwrap();
        let normal = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(query(&normal, "reconnect"), None);

        let resume = build_signal_url(&base, "tok", true, true).unwrap();
        assert_eq!(query(&resume, "reconnect").unwrap(), "1");
    }

    #[test]
    fn auto_subscribe_flag_only_when_enabled() {
        let base = parse_base_url("https://rw.example.com").unwrap();
        let on = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(query(&on, "auto_subscribe").unwrap(), "1");

        let off = build_signal_url(&base, "tok", false, false).unwrap();
        assert_eq!(query(&off, "auto_subscribe"), None);
    }

    #[test]
    fn validate_url_is_http_twin() {
        let base = parse_base_url("wss://rw.example.com/tenant").unwrap();
        let url = build_validate_url(&base, "tok", true).unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.path(), "/tenant/validate");
        assert_eq!(query(&url, "access_token").unwrap(), "tok");
        assert_eq!(query(&url, "reconnect"), None);
    }

    #[test]
    fn base_query_is_discarded() {
        let base = parse_base_url("https://rw.example.com/?stale=1").unwrap();
        let url = build_signal_url(&base, "tok", true, false).unwrap();
        assert_eq!(query(&url, "stale"), None);
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = parse_base_url("ftp://rw.example.com").unwrap_err();
        assert!(matches!(err, RoomWireError::Connect(_)));
    }
}
