//! Image traffic classification.
//!
//! Requests are classified before any upstream call so image fetches can be
//! answered locally. Responses are classified independently from their
//! declared content type, which is the server's ground truth.
//!
//! Two request strategies exist because browsers disagree on how honestly
//! they declare `Accept` for image sub-resources:
//!
//! - **Default**: the request matches when an `Accept` value contains `image`.
//! - **Chromium**: Chromium-derived agents send generic `Accept` values for
//!   prefetched images, so for them the `Accept` header is ignored entirely
//!   and the URL path extension decides.

use std::borrow::Cow;

use hyper::header::{HeaderMap, ACCEPT, CONTENT_TYPE, USER_AGENT};
use hyper::Uri;
use percent_encoding::percent_decode_str;

/// Path suffixes treated as images for Chromium agents.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".avif", ".bmp", ".tiff",
];

/// User agent tokens identifying a Chromium-derived browser.
const CHROMIUM_TOKENS: &[&str] = &["Chrome/", "Chromium/"];

/// Strategy picked for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStrategy {
    /// Match on the `Accept` header.
    AcceptHeader,
    /// Match on the URL path extension.
    PathExtension,
}

/// Selects the strategy from the declared user agent.
pub fn request_strategy(headers: &HeaderMap) -> RequestStrategy {
    let chromium = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(is_chromium_agent);

    if chromium {
        RequestStrategy::PathExtension
    } else {
        RequestStrategy::AcceptHeader
    }
}

/// Returns true if the user agent identifies a Chromium-derived browser.
pub fn is_chromium_agent(user_agent: &str) -> bool {
    CHROMIUM_TOKENS.iter().any(|token| user_agent.contains(token))
}

/// Returns true if the request is image traffic.
///
/// For Chromium agents the path extension is a full override: the `Accept`
/// header is not consulted at all.
pub fn is_image_request(uri: &Uri, headers: &HeaderMap) -> bool {
    match request_strategy(headers) {
        RequestStrategy::AcceptHeader => accepts_image(headers),
        RequestStrategy::PathExtension => has_image_extension(uri.path()),
    }
}

/// Returns true if any `Accept` value contains `image`.
pub fn accepts_image(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .any(|v| contains_image(v.as_bytes(), false))
}

/// Returns true if the percent-decoded path ends in an image extension.
///
/// Only the path is inspected, so `?format=.png` style queries never match.
/// The comparison ignores ASCII case.
pub fn has_image_extension(path: &str) -> bool {
    let decoded: Cow<'_, str> = percent_decode_str(path).decode_utf8_lossy();
    let path = decoded.as_bytes();

    IMAGE_EXTENSIONS.iter().any(|ext| {
        let ext = ext.as_bytes();
        path.len() > ext.len() && path[path.len() - ext.len()..].eq_ignore_ascii_case(ext)
    })
}

/// Returns true if the response declares image content.
pub fn is_image_response(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .is_some_and(|v| contains_image(v.as_bytes(), true))
}

/// Header values may carry obs-text, so they are searched as raw bytes.
fn contains_image(value: &[u8], ignore_case: bool) -> bool {
    value.windows(5).any(|w| {
        if ignore_case {
            w.eq_ignore_ascii_case(b"image")
        } else {
            w == b"image"
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    const CHROME_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
        (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
    const FIREFOX_UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0";

    fn headers(pairs: &[(hyper::header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn accept_image_matches_for_default_agent() {
        let h = headers(&[(USER_AGENT, FIREFOX_UA), (ACCEPT, "image/avif,image/webp,*/*")]);
        assert!(is_image_request(&uri("http://example.com/pixel"), &h));
    }

    #[test]
    fn non_image_accept_does_not_match() {
        let h = headers(&[(ACCEPT, "application/json")]);
        assert!(!is_image_request(&uri("http://example.com/data.json"), &h));
    }

    #[test]
    fn missing_headers_do_not_match() {
        assert!(!is_image_request(&uri("/photo.jpg"), &HeaderMap::new()));
    }

    #[test]
    fn any_accept_value_counts() {
        let h = headers(&[(ACCEPT, "text/html"), (ACCEPT, "image/png")]);
        assert!(accepts_image(&h));
    }

    #[test]
    fn chromium_matches_on_extension_without_image_accept() {
        let h = headers(&[(USER_AGENT, CHROME_UA), (ACCEPT, "*/*")]);
        assert!(is_image_request(&uri("https://example.com/photo.jpg"), &h));
    }

    #[test]
    fn chromium_override_ignores_image_accept() {
        let h = headers(&[(USER_AGENT, CHROME_UA), (ACCEPT, "image/webp,*/*")]);
        assert!(!is_image_request(&uri("https://example.com/api/data.json"), &h));
    }

    #[test]
    fn chromium_strategy_is_selected_from_user_agent() {
        assert_eq!(
            request_strategy(&headers(&[(USER_AGENT, CHROME_UA)])),
            RequestStrategy::PathExtension
        );
        assert_eq!(
            request_strategy(&headers(&[(USER_AGENT, FIREFOX_UA)])),
            RequestStrategy::AcceptHeader
        );
        assert_eq!(request_strategy(&HeaderMap::new()), RequestStrategy::AcceptHeader);
    }

    #[test]
    fn chromium_tokens() {
        assert!(is_chromium_agent(CHROME_UA));
        assert!(is_chromium_agent("Mozilla/5.0 Chromium/120.0 Safari/537.36"));
        assert!(is_chromium_agent("Mozilla/5.0 HeadlessChrome/120.0.0.0"));
        assert!(!is_chromium_agent(FIREFOX_UA));
        assert!(!is_chromium_agent("curl/8.5.0"));
    }

    #[test]
    fn every_listed_extension_matches() {
        for ext in IMAGE_EXTENSIONS {
            assert!(has_image_extension(&format!("/img/file{ext}")), "{ext}");
        }
    }

    #[test]
    fn extension_match_ignores_case() {
        assert!(has_image_extension("/DSC_0001.JPG"));
        assert!(has_image_extension("/logo.Png"));
    }

    #[test]
    fn extension_match_is_a_suffix_match() {
        assert!(!has_image_extension("/photo.jpg.html"));
        assert!(!has_image_extension("/jpg"));
        assert!(!has_image_extension("/pngs/list"));
    }

    #[test]
    fn query_string_is_not_considered() {
        let h = headers(&[(USER_AGENT, CHROME_UA)]);
        assert!(!is_image_request(&uri("https://example.com/render?out=x.png"), &h));
        assert!(is_image_request(&uri("https://example.com/x.png?v=3"), &h));
    }

    #[test]
    fn percent_encoded_path_is_decoded() {
        assert!(has_image_extension("/cat%2Epng"));
        assert!(has_image_extension("/my%20photo.jpeg"));
    }

    #[test]
    fn response_content_type_image() {
        assert!(is_image_response(&headers(&[(CONTENT_TYPE, "image/jpeg")])));
        assert!(is_image_response(&headers(&[(CONTENT_TYPE, "Image/SVG+XML")])));
        assert!(!is_image_response(&headers(&[(CONTENT_TYPE, "text/html")])));
        assert!(!is_image_response(&HeaderMap::new()));
    }

    #[test]
    fn non_ascii_header_values_are_still_classified() {
        let mut req = HeaderMap::new();
        req.insert(ACCEPT, HeaderValue::from_bytes(b"image/webp;q=\xE9").unwrap());
        assert!(accepts_image(&req));

        let mut res = HeaderMap::new();
        res.insert(
            CONTENT_TYPE,
            HeaderValue::from_bytes(b"image/png; name=\"caf\xE9.png\"").unwrap(),
        );
        assert!(is_image_response(&res));

        res.insert(CONTENT_TYPE, HeaderValue::from_bytes(b"text/plain; x=\xE9").unwrap());
        assert!(!is_image_response(&res));
    }
}
