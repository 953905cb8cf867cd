//! Minimal `multipart/related` handling.
//!
//! Only the first part of a response is extracted. Bodies that cannot be
//! split (missing boundary, truncated part) are returned whole.

use bytes::Bytes;

use super::content_type_param;

/// A single body part.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Extract the first part of a multipart body.
///
/// Returns `None` when the body does not follow the boundary declared in
/// `content_type`.
pub fn first_part(body: &Bytes, content_type: &str) -> Option<Part> {
    let boundary = content_type_param(content_type, "boundary")?;
    let delimiter = format!("--{}", boundary);

    let start = find(body, delimiter.as_bytes(), 0)? + delimiter.len();
    let headers_start = find(body, b"\r\n", start)? + 2;
    let headers_end = find(body, b"\r\n\r\n", headers_start.saturating_sub(2))?;
    let body_start = headers_end + 4;

    let closing = format!("\r\n{}", delimiter);
    let body_end = find(body, closing.as_bytes(), body_start)?;

    let headers = std::str::from_utf8(&body[headers_start.min(headers_end)..headers_end]).ok()?;
    let part_type = headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-type")
            .then(|| value.trim().to_string())
    });

    Some(Part {
        content_type: part_type,
        body: body.slice(body_start..body_end),
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
