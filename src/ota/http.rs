//! Minimal HTTP/1.x response header parsing for firmware downloads.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: u16,
    pub content_length: u32,
    /// Offset of the first body byte in the buffer that was parsed
    pub body_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    Malformed,
    Status(u16),
    MissingLength,
    TooLarge,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::Malformed => write!(f, "malformed response header"),
            HeaderError::Status(code) => write!(f, "server returned status {}", code),
            HeaderError::MissingLength => write!(f, "no Content-Length in response"),
            HeaderError::TooLarge => write!(f, "response header too large"),
        }
    }
}

impl std::error::Error for HeaderError {}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Body offset after the blank line ending the header, if one has arrived yet
pub fn header_end(buf: &[u8]) -> Option<usize> {
    let crlf = find(buf, b"\r\n\r\n").map(|i| i + 4);
    let lf = find(buf, b"\n\n").map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse a response header from the start of `buf`.
///
/// Returns `Ok(None)` while the header is still incomplete.
pub fn parse_response_header(buf: &[u8]) -> Result<Option<ResponseHeader>, HeaderError> {
    let Some(body_offset) = header_end(buf) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..body_offset]).map_err(|_| HeaderError::Malformed)?;
    let mut lines = text.lines();

    let status_line = lines.next().ok_or(HeaderError::Malformed)?;
    let mut parts = status_line.split_whitespace();
    let version = parts.next().ok_or(HeaderError::Malformed)?;
    if !version.starts_with("HTTP/1.") {
        return Err(HeaderError::Malformed);
    }
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or(HeaderError::Malformed)?;
    if status != 200 {
        return Err(HeaderError::Status(status));
    }

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.trim().parse::<u32>().map_err(|_| HeaderError::Malformed))
        .ok_or(HeaderError::MissingLength)??;

    Ok(Some(ResponseHeader { status, content_length, body_offset }))
}
