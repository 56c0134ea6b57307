//! Header translation between grpc and grpc-web.
//!
//! A translated response keeps two header sets apart: the head returned by the wrapped
//! service, where entries named with the trailer prefix are *staged* as trailers, and the
//! head physically sent to the client. [`rewrite_response`] is the one-way step between them.

use std::collections::HashSet;

use http::{header, HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::content_types::{has_prefix, GRPC, GRPC_WEB, GRPC_WEB_TEXT};
use crate::Encoding;

/// `application/grpc-web[-text][suffix]` to `application/grpc[suffix]`.
pub(crate) fn grpc_content_type(value: &HeaderValue) -> HeaderValue {
    replace_prefix(value, GRPC_WEB_TEXT, GRPC)
        .or_else(|| replace_prefix(value, GRPC_WEB, GRPC))
        .unwrap_or_else(|| value.clone())
}

/// `application/grpc[suffix]` to the grpc-web content type of `encoding`, suffix preserved.
pub(crate) fn grpc_web_content_type(value: Option<&HeaderValue>, encoding: Encoding) -> HeaderValue {
    match value {
        None => HeaderValue::from_static(encoding.content_type_prefix()),
        Some(value) if has_prefix(value.as_bytes(), GRPC_WEB) => value.clone(),
        Some(value) => replace_prefix(value, GRPC, encoding.content_type_prefix())
            .unwrap_or_else(|| value.clone()),
    }
}

fn replace_prefix(value: &HeaderValue, prefix: &str, replacement: &str) -> Option<HeaderValue> {
    let bytes = value.as_bytes();
    if !has_prefix(bytes, prefix) {
        return None;
    }

    let mut out = Vec::with_capacity(replacement.len() + bytes.len() - prefix.len());
    out.extend_from_slice(replacement.as_bytes());
    out.extend_from_slice(&bytes[prefix.len()..]);

    HeaderValue::from_bytes(&out).ok()
}

/// Name without the trailer prefix, or `None` when `name` doesn't carry it.
fn strip_trailer_prefix(name: &HeaderName, prefix: &str) -> Option<HeaderName> {
    if prefix.is_empty() || !has_prefix(name.as_str().as_bytes(), prefix) {
        return None;
    }

    match HeaderName::from_bytes(&name.as_str().as_bytes()[prefix.len()..]) {
        Ok(stripped) => Some(stripped),
        Err(_) => {
            debug!(header = %name, "ignoring trailer declaration without a name");
            None
        }
    }
}

/// Moves every trailer-prefixed entry out of `headers`, returning them prefix stripped.
pub(crate) fn stage(headers: &mut HeaderMap, prefix: &str) -> HeaderMap {
    if prefix.is_empty() {
        return HeaderMap::new();
    }

    let declared: Vec<HeaderName> = headers
        .keys()
        .filter(|name| has_prefix(name.as_str().as_bytes(), prefix))
        .cloned()
        .collect();

    let mut trailers = HeaderMap::new();
    for name in declared {
        let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
        headers.remove(&name);

        if let Some(stripped) = strip_trailer_prefix(&name, prefix) {
            for value in values {
                trailers.append(stripped.clone(), value);
            }
        }
    }

    trailers
}

/// The header flush: rewrites the staged head into the head sent to a grpc-web client.
///
/// Returns the names that were sent, which never reappear in the trailer frame.
pub(crate) fn rewrite_response(headers: &mut HeaderMap, encoding: Encoding) -> HashSet<HeaderName> {
    let content_type = grpc_web_content_type(headers.get(header::CONTENT_TYPE), encoding);
    headers.insert(header::CONTENT_TYPE, content_type);

    // the translated body never has the backend's length
    headers.remove(header::CONTENT_LENGTH);

    headers.keys().cloned().collect()
}

/// Copies `src` into `dst`, replacing existing values, optionally stripping the trailer prefix.
fn merge(dst: &mut HeaderMap, src: HeaderMap, prefix: &str) {
    let mut current: Option<HeaderName> = None;

    for (name, value) in src {
        if let Some(name) = name {
            let name = strip_trailer_prefix(&name, prefix).unwrap_or(name);
            dst.remove(&name);
            current = Some(name);
        }

        if let Some(name) = &current {
            dst.append(name.clone(), value);
        }
    }
}

/// Computes the trailer set sent in the final frame.
///
/// Staged entries are overridden by the backend's own trailers. The `trailer` announcement
/// and any name already sent as a header are left out.
pub(crate) fn trailer_block(
    staged: HeaderMap,
    trailers: Option<HeaderMap>,
    sent: &HashSet<HeaderName>,
    prefix: &str,
) -> HeaderMap {
    let mut block = staged;
    if let Some(trailers) = trailers {
        merge(&mut block, trailers, prefix);
    }

    block.remove(header::TRAILER);
    for name in sent {
        block.remove(name);
    }

    block
}

/// Folds trailers into the head of a response that has no body.
pub(crate) fn fold_trailers(
    headers: &mut HeaderMap,
    staged: HeaderMap,
    trailers: Option<HeaderMap>,
    prefix: &str,
) {
    merge(headers, staged, prefix);
    if let Some(trailers) = trailers {
        merge(headers, trailers, prefix);
    }

    headers.remove(header::TRAILER);
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "trailer-";

    fn value(s: &str) -> HeaderValue {
        HeaderValue::from_str(s).unwrap()
    }

    #[test]
    fn request_content_types() {
        let cases = &[
            ("application/grpc-web", "application/grpc"),
            ("application/grpc-web+proto", "application/grpc+proto"),
            ("application/grpc-web-text", "application/grpc"),
            ("application/grpc-web-text+proto", "application/grpc+proto"),
            ("Application/GRPC-Web-Text+json", "application/grpc+json"),
            ("application/json", "application/json"),
        ];

        for (input, expected) in cases {
            assert_eq!(grpc_content_type(&value(input)), *expected, "{input}");
        }
    }

    #[test]
    fn response_content_types() {
        let cases = &[
            ("application/grpc", Encoding::None, "application/grpc-web"),
            ("application/grpc+proto", Encoding::None, "application/grpc-web+proto"),
            ("application/grpc+proto", Encoding::Base64, "application/grpc-web-text+proto"),
            ("application/grpc-web+thrift", Encoding::Base64, "application/grpc-web+thrift"),
            ("text/plain", Encoding::Base64, "text/plain"),
        ];

        for (input, encoding, expected) in cases {
            assert_eq!(
                grpc_web_content_type(Some(&value(input)), *encoding),
                *expected,
                "{input}"
            );
        }

        assert_eq!(grpc_web_content_type(None, Encoding::Base64), GRPC_WEB_TEXT);
    }

    #[test]
    fn stage_moves_prefixed_entries() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, value("application/grpc"));
        headers.append("trailer-x-count", value("1"));
        headers.append("trailer-x-count", value("2"));
        headers.insert("trailer-grpc-status", value("0"));

        let staged = stage(&mut headers, PREFIX);

        assert_eq!(headers.len(), 1);
        assert_eq!(staged.get("grpc-status").unwrap(), "0");
        let counts: Vec<_> = staged.get_all("x-count").iter().collect();
        assert_eq!(counts, vec!["1", "2"]);
    }

    #[test]
    fn stage_is_case_insensitive_on_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("trailer-grpc-status", value("0"));

        let staged = stage(&mut headers, "Trailer-");

        assert!(headers.is_empty());
        assert_eq!(staged.get("grpc-status").unwrap(), "0");
    }

    #[test]
    fn stage_ignores_bare_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("trailer-", value("0"));

        let staged = stage(&mut headers, PREFIX);

        assert!(headers.is_empty());
        assert!(staged.is_empty());
    }

    #[test]
    fn the_trailer_header_is_not_prefixed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRAILER, value("grpc-status"));

        assert!(stage(&mut headers, PREFIX).is_empty());
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn rewrite_response_head() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, value("application/grpc+proto"));
        headers.insert(header::CONTENT_LENGTH, value("42"));
        headers.insert("x-request-id", value("Ab-12"));

        let sent = rewrite_response(&mut headers, Encoding::Base64);

        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/grpc-web-text+proto");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(headers.get("x-request-id").unwrap(), "Ab-12");
        assert_eq!(sent.len(), 2);
        assert!(sent.contains(&header::CONTENT_TYPE));
    }

    #[test]
    fn trailer_block_excludes_sent_and_announcement() {
        let mut staged = HeaderMap::new();
        staged.insert("grpc-status", value("2"));
        staged.insert("x-staged", value("yes"));

        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", value("0"));
        trailers.insert("trailer-grpc-message", value("done"));
        trailers.insert(header::TRAILER, value("grpc-status"));
        trailers.insert("x-request-id", value("1"));

        let sent = HashSet::from([HeaderName::from_static("x-request-id")]);
        let block = trailer_block(staged, Some(trailers), &sent, PREFIX);

        let mut expected = HeaderMap::new();
        expected.insert("grpc-status", value("0"));
        expected.insert("x-staged", value("yes"));
        expected.insert("grpc-message", value("done"));
        assert_eq!(block, expected);
    }

    #[test]
    fn fold_trailers_into_head() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, value("application/grpc"));
        headers.insert(header::TRAILER, value("grpc-status"));

        let mut staged = HeaderMap::new();
        staged.insert("x-staged", value("1"));

        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", value("5"));
        trailers.insert("grpc-message", value("not found"));

        fold_trailers(&mut headers, staged, Some(trailers), PREFIX);

        assert!(headers.get(header::TRAILER).is_none());
        assert_eq!(headers.get("x-staged").unwrap(), "1");
        assert_eq!(headers.get("grpc-status").unwrap(), "5");
        assert_eq!(headers.get("grpc-message").unwrap(), "not found");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/grpc");
    }
}
