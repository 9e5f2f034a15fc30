//! Streaming multipart/form-data parser
//!
//! The parser is push based: raw request bytes are fed in whatever pieces the
//! transport delivers them, and events are pulled out until the parser needs
//! more input. Part bodies are emitted as they arrive, so a file part never
//! has to be held in memory.
//!
//! # Framing
//!
//! ```text
//! preamble CRLF "--" boundary CRLF
//! headers CRLF CRLF body
//! CRLF "--" boundary CRLF
//! headers CRLF CRLF body
//! CRLF "--" boundary "--" epilogue
//! ```
//!
//! Scanning works on raw bytes throughout. A delimiter can straddle two
//! reads, so when no full delimiter is found the last `delimiter.len() - 1`
//! bytes stay buffered and are scanned again together with the next read.

use bytes::{Buf, Bytes, BytesMut};

use super::error::{Result, TransferError};
use super::paths::percent_decode;

/// Upper bound for a single part's header block.
pub const MAX_HEADER_BLOCK: usize = 16 * 1024;

/// RFC 2046 limits boundaries to 70 characters.
pub const MAX_BOUNDARY_LEN: usize = 70;

/// Headers of one part, as far as form uploads need them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartEvent {
    PartStart(PartHeaders),
    Data(Bytes),
    PartEnd,
    /// The closing delimiter was seen; anything after it is ignored.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Finished,
}

#[derive(Debug)]
pub struct MultipartParser {
    /// `CRLF "--" boundary`
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: State,
    finished_emitted: bool,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        // A leading CRLF lets the first delimiter match like all the others
        // even when the body starts with it directly.
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        buffer.extend_from_slice(b"\r\n");

        Self {
            delimiter,
            buffer,
            state: State::Preamble,
            finished_emitted: false,
        }
    }

    /// Append the next piece of the raw body.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.state != State::Finished {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Next parsed event, or `None` when more input is required.
    pub fn next_event(&mut self) -> Result<Option<MultipartEvent>> {
        loop {
            match self.state {
                State::Preamble => match find(&self.buffer, &self.delimiter) {
                    Some(idx) => {
                        self.buffer.advance(idx + self.delimiter.len());
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buffer.len() > keep {
                            let discard = self.buffer.len() - keep;
                            self.buffer.advance(discard);
                        }
                        return Ok(None);
                    }
                },

                State::AfterDelimiter => {
                    // Transport padding is allowed between delimiter and CRLF.
                    while matches!(self.buffer.first(), Some(b' ' | b'\t')) {
                        self.buffer.advance(1);
                    }
                    if self.buffer.len() < 2 {
                        return Ok(None);
                    }
                    match &self.buffer[..2] {
                        b"--" => {
                            self.state = State::Finished;
                            self.buffer.clear();
                        }
                        b"\r\n" => {
                            self.buffer.advance(2);
                            self.state = State::Headers;
                        }
                        _ => {
                            return Err(TransferError::malformed(
                                "multipart delimiter not followed by CRLF",
                            ))
                        }
                    }
                }

                State::Headers => {
                    // No headers at all: the blank line follows immediately.
                    if self.buffer.starts_with(b"\r\n") {
                        self.buffer.advance(2);
                        self.state = State::Body;
                        return Ok(Some(MultipartEvent::PartStart(PartHeaders::default())));
                    }
                    match find(&self.buffer, b"\r\n\r\n") {
                        Some(idx) => {
                            let headers = parse_part_headers(&self.buffer[..idx]);
                            self.buffer.advance(idx + 4);
                            self.state = State::Body;
                            return Ok(Some(MultipartEvent::PartStart(headers)));
                        }
                        None if self.buffer.len() > MAX_HEADER_BLOCK => {
                            return Err(TransferError::malformed(format!(
                                "multipart part headers exceed {MAX_HEADER_BLOCK} bytes"
                            )));
                        }
                        None => return Ok(None),
                    }
                }

                State::Body => match find(&self.buffer, &self.delimiter) {
                    Some(0) => {
                        self.buffer.advance(self.delimiter.len());
                        self.state = State::AfterDelimiter;
                        return Ok(Some(MultipartEvent::PartEnd));
                    }
                    Some(idx) => {
                        let data = self.buffer.split_to(idx).freeze();
                        return Ok(Some(MultipartEvent::Data(data)));
                    }
                    None => {
                        // The tail may be the start of a delimiter split
                        // across reads; hold it back for the next scan.
                        let keep = self.delimiter.len() - 1;
                        if self.buffer.len() <= keep {
                            return Ok(None);
                        }
                        let safe = self.buffer.len() - keep;
                        let data = self.buffer.split_to(safe).freeze();
                        return Ok(Some(MultipartEvent::Data(data)));
                    }
                },

                State::Finished => {
                    if self.finished_emitted {
                        return Ok(None);
                    }
                    self.finished_emitted = true;
                    return Ok(Some(MultipartEvent::Finished));
                }
            }
        }
    }

    /// Call once the input is exhausted.
    pub fn finish(&self) -> Result<()> {
        match self.state {
            State::Finished => Ok(()),
            State::Preamble => Err(TransferError::malformed(
                "multipart body contains no boundary",
            )),
            _ => Err(TransferError::malformed(
                "multipart body ended before the closing boundary",
            )),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }
}

/// Extract the boundary token from a `multipart/form-data` content type.
pub fn parse_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty() && b.len() <= MAX_BOUNDARY_LEN)
}

/// True when the content type announces a multipart form body.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("multipart/form-data"))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_part_headers(block: &[u8]) -> PartHeaders {
    let mut headers = PartHeaders::default();
    for line in block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        // Header values are UTF-8 in practice (browsers send raw UTF-8 file
        // names); decoding happens per line so offsets above stay byte based.
        let line = String::from_utf8_lossy(line);
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-disposition" => {
                let mut filename_ext = None;
                for (key, val) in disposition_params(value) {
                    match key.as_str() {
                        "name" => headers.name = Some(val),
                        "filename" => headers.filename = Some(val),
                        "filename*" => filename_ext = decode_ext_value(&val),
                        _ => {}
                    }
                }
                if filename_ext.is_some() {
                    headers.filename = filename_ext;
                }
            }
            "content-type" => headers.content_type = Some(value.to_string()),
            _ => {}
        }
    }
    headers
}

/// Split `form-data; name="a"; filename="b;c.txt"` into lower-cased keys and
/// unquoted values. Quoted values may contain `;` and backslash escapes.
fn disposition_params(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = value.chars().peekable();

    // Skip the disposition type.
    for c in chars.by_ref() {
        if c == ';' {
            break;
        }
    }

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ';') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            break;
        }
        let mut val = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                val.push(escaped);
                            }
                        }
                        '"' => break,
                        c => val.push(c),
                    }
                }
                // Drop anything up to the next separator.
                while chars.peek().is_some_and(|c| *c != ';') {
                    chars.next();
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ';' {
                        break;
                    }
                    val.push(c);
                    chars.next();
                }
                val = val.trim().to_string();
            }
        }
        params.push((key.trim().to_ascii_lowercase(), val));
    }
    params
}

/// RFC 5987 `charset'lang'percent-encoded`, UTF-8 only.
fn decode_ext_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _lang = parts.next()?;
    let encoded = parts.next()?;
    charset
        .eq_ignore_ascii_case("utf-8")
        .then(|| percent_decode(encoded))
}


#[cfg(test)]
mod tests {
    use super::test_support::{build_body, TestPart};
    use super::*;

    const BOUNDARY: &str = "----QuickHubBoundary7MA4YWxkTrZu0gW";

    /// Feed `body` in pieces of `chunk_size` and collect parts.
    fn parse_in_chunks(body: &[u8], chunk_size: usize) -> Vec<(PartHeaders, Vec<u8>)> {
        let mut parser = MultipartParser::new(BOUNDARY);
        let mut parts: Vec<(PartHeaders, Vec<u8>)> = Vec::new();
        let mut finished = false;
        for chunk in body.chunks(chunk_size) {
            parser.push(chunk);
            while let Some(event) = parser.next_event().unwrap() {
                match event {
                    MultipartEvent::PartStart(h) => parts.push((h, Vec::new())),
                    MultipartEvent::Data(d) => parts.last_mut().unwrap().1.extend_from_slice(&d),
                    MultipartEvent::PartEnd => {}
                    MultipartEvent::Finished => finished = true,
                }
            }
        }
        parser.finish().unwrap();
        assert!(finished);
        parts
    }

    fn binary_payload() -> Vec<u8> {
        // Every byte value plus fragments that look like the delimiter.
        let mut data: Vec<u8> = (0..=255u8).collect();
        data.extend_from_slice(b"\r\n--");
        data.extend_from_slice(&BOUNDARY.as_bytes()[..10]);
        data.extend_from_slice(b"\r\n\r\n--\r\n-");
        data.extend((0..=255u8).rev());
        data.extend_from_slice(b"\r\n--");
        data
    }

    #[test]
    fn test_parses_metadata_and_file_part() {
        let body = build_body(
            BOUNDARY,
            &[
                TestPart { name: "metadata", filename: None, body: br#"{"dirname":"docs"}"# },
                TestPart { name: "files", filename: Some("hello.txt"), body: b"hello world" },
            ],
        );
        let parts = parse_in_chunks(&body, body.len());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0.name.as_deref(), Some("metadata"));
        assert!(parts[0].0.filename.is_none());
        assert_eq!(parts[0].1, br#"{"dirname":"docs"}"#);
        assert_eq!(parts[1].0.filename.as_deref(), Some("hello.txt"));
        assert_eq!(parts[1].0.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(parts[1].1, b"hello world");
    }

    #[test]
    fn test_boundary_split_across_small_reads() {
        let payload = binary_payload();
        let body = build_body(
            BOUNDARY,
            &[TestPart { name: "files", filename: Some("blob.bin"), body: &payload }],
        );
        // Small sizes force the delimiter to straddle reads at every offset.
        for chunk_size in 1..=(BOUNDARY.len() + 8) {
            let parts = parse_in_chunks(&body, chunk_size);
            assert_eq!(parts.len(), 1, "chunk size {chunk_size}");
            assert_eq!(parts[0].1, payload, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_every_split_point_of_two_reads() {
        let payload = binary_payload();
        let body = build_body(
            BOUNDARY,
            &[TestPart { name: "files", filename: Some("blob.bin"), body: &payload }],
        );
        for split in 1..body.len() {
            let mut parser = MultipartParser::new(BOUNDARY);
            let mut data = Vec::new();
            for piece in [&body[..split], &body[split..]] {
                parser.push(piece);
                while let Some(event) = parser.next_event().unwrap() {
                    if let MultipartEvent::Data(d) = event {
                        data.extend_from_slice(&d);
                    }
                }
            }
            parser.finish().unwrap();
            assert_eq!(data, payload, "split at {split}");
        }
    }

    #[test]
    fn test_ignores_preamble_and_epilogue() {
        let mut body = b"this is a preamble\r\n".to_vec();
        body.extend(build_body(
            BOUNDARY,
            &[TestPart { name: "files", filename: Some("a.txt"), body: b"abc" }],
        ));
        body.extend_from_slice(b"trailing epilogue");
        let parts = parse_in_chunks(&body, 7);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].1, b"abc");
    }

    #[test]
    fn test_empty_file_part() {
        let body = build_body(
            BOUNDARY,
            &[TestPart { name: "files", filename: Some("empty.txt"), body: b"" }],
        );
        let parts = parse_in_chunks(&body, 3);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].1.is_empty());
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let body = build_body(
            BOUNDARY,
            &[TestPart { name: "files", filename: Some("a.txt"), body: b"abcdef" }],
        );
        let cut = &body[..body.len() - 12];
        let mut parser = MultipartParser::new(BOUNDARY);
        parser.push(cut);
        while parser.next_event().unwrap().is_some() {}
        assert!(matches!(parser.finish(), Err(TransferError::MalformedRequest(_))));
    }

    #[test]
    fn test_body_without_boundary_is_rejected() {
        let mut parser = MultipartParser::new(BOUNDARY);
        parser.push(b"just some bytes");
        assert!(parser.next_event().unwrap().is_none());
        assert!(matches!(parser.finish(), Err(TransferError::MalformedRequest(_))));
    }

    #[test]
    fn test_oversized_headers_are_rejected() {
        let mut parser = MultipartParser::new(BOUNDARY);
        parser.push(format!("--{BOUNDARY}\r\n").as_bytes());
        parser.push(&vec![b'x'; MAX_HEADER_BLOCK + 1]);
        assert!(matches!(parser.next_event(), Err(TransferError::MalformedRequest(_))));
    }

    #[test]
    fn test_garbage_after_delimiter_is_rejected() {
        let mut parser = MultipartParser::new(BOUNDARY);
        parser.push(format!("--{BOUNDARY}XX").as_bytes());
        assert!(matches!(parser.next_event(), Err(TransferError::MalformedRequest(_))));
    }

    #[test]
    fn test_disposition_params() {
        let headers = parse_part_headers(
            b"Content-Disposition: form-data; name=\"files\"; filename=\"a;b \\\"c\\\".txt\"\r\nContent-Type: text/plain",
        );
        assert_eq!(headers.name.as_deref(), Some("files"));
        assert_eq!(headers.filename.as_deref(), Some("a;b \"c\".txt"));
        assert_eq!(headers.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_extended_filename_wins() {
        let headers = parse_part_headers(
            b"content-disposition: form-data; name=files; filename=\"fallback.txt\"; filename*=UTF-8''r%C3%A9sum%C3%A9.txt",
        );
        assert_eq!(headers.name.as_deref(), Some("files"));
        assert_eq!(headers.filename.as_deref(), Some("résumé.txt"));
    }

    #[test]
    fn test_utf8_filename() {
        let headers = parse_part_headers(
            "Content-Disposition: form-data; name=\"files\"; filename=\"照片.jpg\"".as_bytes(),
        );
        assert_eq!(headers.filename.as_deref(), Some("照片.jpg"));
    }

    #[test]
    fn test_parse_boundary() {
        assert_eq!(
            parse_boundary("multipart/form-data; boundary=----abc123").as_deref(),
            Some("----abc123")
        );
        assert_eq!(
            parse_boundary("Multipart/Form-Data; charset=utf-8; boundary=\"quoted\"").as_deref(),
            Some("quoted")
        );
        assert_eq!(parse_boundary("multipart/form-data"), None);
        assert_eq!(parse_boundary("application/json; boundary=x"), None);
        assert_eq!(parse_boundary(&format!("multipart/form-data; boundary={}", "x".repeat(71))), None);
        assert!(is_multipart("multipart/form-data; boundary=x"));
        assert!(!is_multipart("application/octet-stream"));
    }
}
