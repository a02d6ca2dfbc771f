//! gzip response compression.

use flate2::{write::GzEncoder, Compression};
use http::{header, HeaderMap};
use std::io::Write;

/// Bodies shorter than this are sent as-is.
const MIN_LENGTH: usize = 30;

/// Whether the client lists `gzip` (or `*`) with a nonzero quality.
pub(crate) fn accepts_gzip(request: &HeaderMap) -> bool {
    request
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| {
            let mut params = coding.split(';').map(str::trim);
            let name = params.next().unwrap_or_default();
            if !name.eq_ignore_ascii_case("gzip") && name != "*" {
                return false;
            }
            params
                .filter_map(|p| p.strip_prefix("q="))
                .all(|q| q.parse::<f32>().map_or(true, |q| q > 0.0))
        })
}

/// Whether a response with these headers may be compressed.
pub(crate) fn is_compressible(response: &HeaderMap) -> bool {
    if response.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    if let Some(cc) = response.get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        if cc.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-transform")) {
            return false;
        }
    }
    let Some(ct) = response
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let ct = ct.to_ascii_lowercase();
    if ct.starts_with("application/grpc") {
        return false;
    }
    ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("xml")
        || ct.contains("javascript")
}

/// Compresses `body`, updating the response headers. Returns `None` when the
/// body is too short to be worth compressing.
pub(crate) fn gzip(headers: &mut HeaderMap, body: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
    if body.len() < MIN_LENGTH {
        return Ok(None);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    let compressed = encoder.finish()?;

    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::ETAG);
    headers.insert(
        header::CONTENT_ENCODING,
        header::HeaderValue::from_static("gzip"),
    );
    headers.append(
        header::VARY,
        header::HeaderValue::from_static("accept-encoding"),
    );
    Ok(Some(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn headers(pairs: &[(header::HeaderName, &'static str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(k, v)| (k.clone(), header::HeaderValue::from_static(v)))
            .collect()
    }

    #[test]
    fn negotiation() {
        assert!(accepts_gzip(&headers(&[(
            header::ACCEPT_ENCODING,
            "deflate, gzip;q=0.8"
        )])));
        assert!(accepts_gzip(&headers(&[(header::ACCEPT_ENCODING, "*")])));
        assert!(!accepts_gzip(&headers(&[(
            header::ACCEPT_ENCODING,
            "gzip;q=0"
        )])));
        assert!(!accepts_gzip(&headers(&[(header::ACCEPT_ENCODING, "br")])));
        assert!(!accepts_gzip(&HeaderMap::new()));
    }

    #[test]
    fn compressible_types() {
        assert!(is_compressible(&headers(&[(
            header::CONTENT_TYPE,
            "application/json"
        )])));
        assert!(!is_compressible(&headers(&[(
            header::CONTENT_TYPE,
            "image/png"
        )])));
        assert!(!is_compressible(&headers(&[
            (header::CONTENT_TYPE, "text/plain"),
            (header::CONTENT_ENCODING, "br"),
        ])));
        assert!(!is_compressible(&headers(&[
            (header::CONTENT_TYPE, "text/plain"),
            (header::CACHE_CONTROL, "public, no-transform"),
        ])));
        assert!(!is_compressible(&headers(&[(
            header::CONTENT_TYPE,
            "application/grpc+json"
        )])));
    }

    #[test]
    fn compresses() {
        let body = "hello world ".repeat(16);
        let mut hdrs = headers(&[(header::CONTENT_LENGTH, "192")]);
        let compressed = gzip(&mut hdrs, body.as_bytes()).unwrap().unwrap();
        assert_eq!(hdrs.get(header::CONTENT_ENCODING).unwrap(), "gzip");
        assert!(!hdrs.contains_key(header::CONTENT_LENGTH));

        let mut decoded = String::new();
        GzDecoder::new(&compressed[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);

        assert!(gzip(&mut HeaderMap::new(), b"short").unwrap().is_none());
    }
}
