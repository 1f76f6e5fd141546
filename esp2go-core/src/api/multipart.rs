//! Streaming `multipart/form-data` reader.
//!
//! Browsers upload firmware and files as multipart bodies. [`MultipartFile`]
//! skips to the first part carrying a `filename` and exposes only that part's
//! bytes through [`Read`], holding back at most one delimiter's worth of data.

use std::io::{self, Read};

const READ_CHUNK: usize = 1024;
const MAX_HEADER_BYTES: usize = 8 * 1024;

pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Body,
    Done,
}

pub struct MultipartFile<R> {
    inner: R,
    open_delim: Vec<u8>,
    body_delim: Vec<u8>,
    buf: Vec<u8>,
    state: State,
    filename: Option<String>,
    eof: bool,
}

impl<R: Read> MultipartFile<R> {
    pub fn new(inner: R, boundary: &str) -> Self {
        let open_delim = [b"--".as_slice(), boundary.as_bytes()].concat();
        let body_delim = [b"\r\n".as_slice(), &open_delim].concat();
        Self {
            inner,
            open_delim,
            body_delim,
            buf: Vec::with_capacity(READ_CHUNK * 2),
            state: State::Preamble,
            filename: None,
            eof: false,
        }
    }

    /// Positions the reader at the file part's data. Called lazily by `read`.
    pub fn start(&mut self) -> io::Result<()> {
        if self.state == State::Preamble {
            self.seek_file_part()?;
        }
        Ok(())
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            self.eof = true;
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn seek_file_part(&mut self) -> io::Result<()> {
        let mut delim = self.open_delim.clone();
        loop {
            let pos = loop {
                if let Some(pos) = find(&self.buf, &delim) {
                    break pos;
                }
                if self.eof {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "multipart body has no file part",
                    ));
                }
                let keep = delim.len().saturating_sub(1);
                if self.buf.len() > keep {
                    self.buf.drain(..self.buf.len() - keep);
                }
                self.fill()?;
            };
            self.buf.drain(..pos + delim.len());

            while self.buf.len() < 2 && !self.eof {
                self.fill()?;
            }
            if self.buf.starts_with(b"--") {
                self.state = State::Done;
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "multipart body has no file part",
                ));
            }

            let header_end = loop {
                if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                    break pos;
                }
                if self.eof || self.buf.len() > MAX_HEADER_BYTES {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "malformed multipart part headers",
                    ));
                }
                self.fill()?;
            };
            let headers = String::from_utf8_lossy(&self.buf[..header_end]).into_owned();
            self.buf.drain(..header_end + 4);

            if let Some(name) = filename_from_headers(&headers) {
                self.filename = Some(name);
                self.state = State::Body;
                return Ok(());
            }
            // Plain form field; its value runs up to the next delimiter.
            delim = self.body_delim.clone();
        }
    }
}

impl<R: Read> Read for MultipartFile<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        self.start()?;
        loop {
            if self.state == State::Done {
                return Ok(0);
            }
            if let Some(pos) = find(&self.buf, &self.body_delim) {
                if pos == 0 {
                    self.state = State::Done;
                    self.buf.clear();
                    return Ok(0);
                }
                let n = pos.min(out.len());
                out[..n].copy_from_slice(&self.buf[..n]);
                self.buf.drain(..n);
                return Ok(n);
            }
            let safe = self.buf.len().saturating_sub(self.body_delim.len() - 1);
            if safe > 0 {
                let n = safe.min(out.len());
                out[..n].copy_from_slice(&self.buf[..n]);
                self.buf.drain(..n);
                return Ok(n);
            }
            if self.eof {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "multipart body ended before closing boundary",
                ));
            }
            self.fill()?;
        }
    }
}

fn filename_from_headers(headers: &str) -> Option<String> {
    let disposition = headers
        .split("\r\n")
        .find(|line| line.to_ascii_lowercase().starts_with("content-disposition:"))?;
    disposition.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        Some(value.trim().trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
