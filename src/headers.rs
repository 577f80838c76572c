use bytes::Bytes;
use http::Method;

use crate::clock::Clock;
use crate::error::Error;

/// Validate and normalize headers supplied by the application.
///
/// Names are lower-cased; pseudo headers and names or values containing
/// control bytes are rejected as application errors.
pub(crate) fn build_and_validate_headers(
    headers: &[(Bytes, Bytes)],
) -> Result<Vec<(Bytes, Bytes)>, Error> {
    let mut validated = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        if name.first() == Some(&b':') {
            return Err(Error::InvalidHeader);
        }
        if !name.iter().all(|&b| is_token_byte(b)) || name.is_empty() {
            return Err(Error::InvalidHeader);
        }
        if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0) {
            return Err(Error::InvalidHeader);
        }
        validated.push((lowercase(name), value.clone()));
    }
    Ok(validated)
}

fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

pub(crate) fn lowercase(name: &[u8]) -> Bytes {
    if name.iter().any(u8::is_ascii_uppercase) {
        Bytes::from(name.to_ascii_lowercase())
    } else {
        Bytes::copy_from_slice(name)
    }
}

/// The `date` and `server` headers every response carries.
pub(crate) fn response_headers(
    clock: &dyn Clock,
    protocol: &str,
    include_server: bool,
) -> Vec<(Bytes, Bytes)> {
    let mut headers = vec![(
        Bytes::from_static(b"date"),
        Bytes::from(httpdate::fmt_http_date(clock.now())),
    )];
    if include_server {
        headers.push((
            Bytes::from_static(b"server"),
            Bytes::from(format!("tricorn-{protocol}")),
        ));
    }
    headers
}

/// Stamp `date` and `server` onto application-supplied headers.
///
/// An application `date` is dropped in favor of the injected clock; an
/// application `server` is kept and suppresses the core's own.
pub(crate) fn stamp_response_headers(
    app_headers: Vec<(Bytes, Bytes)>,
    clock: &dyn Clock,
    protocol: &str,
    include_server: bool,
) -> Vec<(Bytes, Bytes)> {
    let app_has_server = app_headers.iter().any(|(name, _)| name.as_ref() == b"server");
    let mut headers: Vec<(Bytes, Bytes)> = app_headers
        .into_iter()
        .filter(|(name, _)| name.as_ref() != b"date")
        .collect();
    headers.extend(response_headers(
        clock,
        protocol,
        include_server && !app_has_server,
    ));
    headers
}

/// Whether a response to `method` with `status` must not carry a body.
pub(crate) fn suppress_body(method: &Method, status: u16) -> bool {
    method == Method::HEAD || status < 200 || status == 204 || status == 304
}

/// Split a comma separated header value into trimmed tokens.
pub(crate) fn split_comma_header(value: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(value)
        .split(',')
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
        .collect()
}

const HOP_BY_HOP: &[&[u8]] = &[
    b"connection",
    b"keep-alive",
    b"proxy-authenticate",
    b"proxy-authorization",
    b"proxy-connection",
    b"te",
    b"trailer",
    b"transfer-encoding",
    b"upgrade",
];

/// Drop connection-specific headers, which are illegal on HTTP/2 and HTTP/3.
pub(crate) fn filter_hop_by_hop(headers: Vec<(Bytes, Bytes)>) -> Vec<(Bytes, Bytes)> {
    headers
        .into_iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_ref()))
        .collect()
}

pub(crate) fn header_value<'h>(headers: &'h [(Bytes, Bytes)], name: &[u8]) -> Option<&'h Bytes> {
    headers
        .iter()
        .find(|(header, _)| header.as_ref() == name)
        .map(|(_, value)| value)
}

/// Case-insensitive equality against a header value.
pub(crate) fn header_eq(headers: &[(Bytes, Bytes)], name: &[u8], expected: &str) -> bool {
    header_value(headers, name)
        .map(|value| value.eq_ignore_ascii_case(expected.as_bytes()))
        .unwrap_or(false)
}

/// Whether a comma separated header value contains a token.
pub(crate) fn header_contains_token(headers: &[(Bytes, Bytes)], name: &[u8], token: &str) -> bool {
    header_value(headers, name)
        .map(|value| {
            split_comma_header(value)
                .iter()
                .any(|t| t.eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}
