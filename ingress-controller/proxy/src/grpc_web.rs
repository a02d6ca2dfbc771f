//! Translation between gRPC-Web clients and gRPC backends.
//!
//! Only the binary encoding is translated; `application/grpc-web-text`
//! requests are forwarded unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderValue};

const GRPC: &str = "application/grpc";
const GRPC_WEB: &str = "application/grpc-web";

/// Marks a length-prefixed message as carrying trailers.
const TRAILERS_FLAG: u8 = 0x80;

/// If the request is a binary gRPC-Web request, rewrites its headers for a
/// gRPC backend and returns true.
pub(crate) fn translate_request(headers: &mut HeaderMap) -> bool {
    let Some(ct) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(suffix) = ct.strip_prefix(GRPC_WEB) else {
        return false;
    };
    if suffix.starts_with("-text") {
        return false;
    }
    let Ok(grpc) = HeaderValue::from_str(&format!("{GRPC}{suffix}")) else {
        return false;
    };
    headers.insert(header::CONTENT_TYPE, grpc);
    headers.insert(header::TE, HeaderValue::from_static("trailers"));
    headers.remove(header::CONTENT_LENGTH);
    headers.remove("x-grpc-web");
    true
}

/// Rewrites a gRPC response's content type for a gRPC-Web client.
pub(crate) fn translate_response_headers(headers: &mut HeaderMap) {
    let ct = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.strip_prefix(GRPC))
        .and_then(|suffix| HeaderValue::from_str(&format!("{GRPC_WEB}{suffix}")).ok());
    if let Some(ct) = ct {
        headers.insert(header::CONTENT_TYPE, ct);
    }
    headers.remove(header::CONTENT_LENGTH);
}

/// Appends the response trailers to the body as a trailers frame.
pub(crate) fn encode_trailers(body: Bytes, trailers: Option<&HeaderMap>) -> Bytes {
    let Some(trailers) = trailers.filter(|t| !t.is_empty()) else {
        return body;
    };
    let mut block = Vec::new();
    for (name, value) in trailers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b":");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }

    let mut buf = BytesMut::with_capacity(body.len() + 5 + block.len());
    buf.put(body);
    buf.put_u8(TRAILERS_FLAG);
    buf.put_u32(block.len() as u32);
    buf.put_slice(&block);
    buf.freeze()
}
