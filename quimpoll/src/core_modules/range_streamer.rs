// THEORY:
// The `RangeStreamer` serves the output video the way browsers expect to stream
// it: a request without `Range` gets the whole file, a request with one gets just
// the bytes it asked for plus a `Content-Range` describing them.
//
// Key architectural principles:
// 1.  **Strict Grammar**: Only `bytes=<digits>-<digits>?` is accepted. Suffix
//     ranges, multiple ranges, whitespace, or anything unparsable are rejected as
//     malformed instead of being read as "from byte 0".
// 2.  **Validate Before Seeking**: `start` must lie inside the resource and an
//     explicit `end` must lie between `start` and the last byte. Out-of-bounds
//     requests are rejected as unsatisfiable, never clamped.
// 3.  **Transport Agnostic**: This module does the arithmetic and the file I/O.
//     Turning the outcome into status codes and headers is the HTTP layer's job.

use crate::error::RangeError;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const UNIT_PREFIX: &str = "bytes=";

/// A syntactically valid single byte range, not yet checked against a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive last byte, if the client gave one.
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn parse(header: &str) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(header.to_string());

        let range_set = header.strip_prefix(UNIT_PREFIX).ok_or_else(malformed)?;
        let (start, end) = range_set.split_once('-').ok_or_else(malformed)?;

        let start = parse_digits(start).ok_or_else(malformed)?;
        let end = if end.is_empty() {
            None
        } else {
            Some(parse_digits(end).ok_or_else(malformed)?)
        };

        Ok(Self { start, end })
    }

    /// Checks the range against a resource of `size` bytes.
    pub fn resolve(&self, size: u64) -> Result<ResolvedRange, RangeError> {
        let unsatisfiable = || RangeError::Unsatisfiable {
            start: self.start,
            end: self.end,
            size,
        };

        if self.start >= size {
            return Err(unsatisfiable());
        }
        let length = match self.end {
            Some(end) if end < self.start || end >= size => return Err(unsatisfiable()),
            Some(end) => end - self.start + 1,
            None => size - self.start,
        };

        Ok(ResolvedRange {
            start: self.start,
            length,
            size,
        })
    }
}

fn parse_digits(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// A validated, non-empty range inside a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub length: u64,
    pub size: u64,
}

impl ResolvedRange {
    pub fn last(&self) -> u64 {
        self.start + self.length - 1
    }

    /// Value for the `Content-Range` response header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.last(), self.size)
    }
}

/// Value for `Content-Range` on a 416 response.
pub fn unsatisfied_content_range(size: u64) -> String {
    format!("bytes */{size}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamResponse {
    /// No range requested: the whole resource.
    Full { body: Vec<u8> },
    /// The requested slice.
    Partial { body: Vec<u8>, range: ResolvedRange },
}

impl StreamResponse {
    pub fn body(&self) -> &[u8] {
        match self {
            StreamResponse::Full { body } | StreamResponse::Partial { body, .. } => body,
        }
    }

    pub fn into_body(self) -> Vec<u8> {
        match self {
            StreamResponse::Full { body } | StreamResponse::Partial { body, .. } => body,
        }
    }
}

/// Serves one file under the byte-range protocol.
#[derive(Debug, Clone)]
pub struct RangeStreamer {
    path: PathBuf,
}

impl RangeStreamer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn serve(&self, range_header: Option<&str>) -> Result<StreamResponse, RangeError> {
        let requested = range_header.map(ByteRange::parse).transpose()?;

        let mut file = File::open(&self.path).await?;
        let size = file.metadata().await?.len();

        let Some(requested) = requested else {
            let mut body = Vec::with_capacity(size as usize);
            file.read_to_end(&mut body).await?;
            return Ok(StreamResponse::Full { body });
        };

        let range = requested.resolve(size)?;
        file.seek(SeekFrom::Start(range.start)).await?;
        let mut body = vec![0u8; range.length as usize];
        file.read_exact(&mut body).await?;

        Ok(StreamResponse::Partial { body, range })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::output_store::tests::scratch_dir;

    fn fixture(name: &str, size: usize) -> (PathBuf, Vec<u8>) {
        let dir = scratch_dir(name);
        std::fs::create_dir_all(&dir).unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let path = dir.join("output.mp4");
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    fn span(start: u64, end: Option<u64>) -> ByteRange {
        ByteRange { start, end }
    }

    #[test]
    fn parses_closed_and_open_ranges() {
        assert_eq!(ByteRange::parse("bytes=200-499"), Ok(span(200, Some(499))));
        assert_eq!(ByteRange::parse("bytes=0-"), Ok(span(0, None)));
    }

    #[test]
    fn rejects_malformed_headers() {
        for header in [
            "bytes=abc",
            "bytes=",
            "bytes=-500",
            "bytes=1-2,5-6",
            "bytes= 1-2",
            "bytes=1-x",
            "items=1-2",
            "1-2",
            "bytes=99999999999999999999999-",
        ] {
            assert!(
                matches!(ByteRange::parse(header), Err(RangeError::Malformed(_))),
                "{header} should be malformed"
            );
        }
    }

    #[test]
    fn resolves_lengths_and_content_range() {
        let closed = span(200, Some(499)).resolve(1000).unwrap();
        assert_eq!(closed.length, 300);
        assert_eq!(closed.content_range(), "bytes 200-499/1000");

        let open = span(900, None).resolve(1000).unwrap();
        assert_eq!(open.length, 100);
        assert_eq!(open.content_range(), "bytes 900-999/1000");

        let single = span(7, Some(7)).resolve(8).unwrap();
        assert_eq!(single.length, 1);
    }

    #[test]
    fn rejects_out_of_bounds_ranges() {
        let cases = [
            (span(1000, None), 1000),
            (span(10, Some(1000)), 1000),
            (span(10, Some(9)), 1000),
            (span(0, None), 0),
        ];
        for (range, size) in cases {
            assert!(
                matches!(range.resolve(size), Err(RangeError::Unsatisfiable { .. })),
                "{range:?} on {size}"
            );
        }
        assert_eq!(unsatisfied_content_range(1000), "bytes */1000");
    }

    #[tokio::test]
    async fn partial_request_returns_exact_slice() {
        let (path, data) = fixture("range-partial", 1024);
        let response = RangeStreamer::new(&path).serve(Some("bytes=200-499")).await.unwrap();
        match response {
            StreamResponse::Partial { body, range } => {
                assert_eq!(body.len(), 300);
                assert_eq!(body, data[200..500].to_vec());
                assert_eq!(range.content_range(), "bytes 200-499/1024");
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_header_returns_whole_resource() {
        let (path, data) = fixture("range-full", 777);
        let response = RangeStreamer::new(&path).serve(None).await.unwrap();
        assert_eq!(response, StreamResponse::Full { body: data });
    }

    #[tokio::test]
    async fn open_ended_request_runs_to_the_end() {
        let (path, data) = fixture("range-open", 600);
        let response = RangeStreamer::new(&path).serve(Some("bytes=550-")).await.unwrap();
        assert_eq!(response.body(), &data[550..]);
    }

    #[tokio::test]
    async fn malformed_header_is_an_error_not_a_full_read() {
        let (path, _) = fixture("range-malformed", 600);
        let err = RangeStreamer::new(&path).serve(Some("bytes=abc")).await.unwrap_err();
        assert_eq!(err, RangeError::Malformed("bytes=abc".into()));
    }

    #[tokio::test]
    async fn missing_resource_is_not_found() {
        let dir = scratch_dir("range-missing");
        let err = RangeStreamer::new(dir.join("output.mp4")).serve(None).await.unwrap_err();
        assert_eq!(err, RangeError::NotFound);
    }
}
