//! Streaming `multipart/form-data` parser.
//!
//! ## Overview
//!
//! Two entry points share the same part state machine:
//!
//! - [`parse`] walks a body that is already in memory (the common case for
//!   small requests).
//! - [`parse_file`] streams a body that the request pipeline spilled to a
//!   temp file, reading line-wise for part headers and in bounded windows
//!   for part content so memory stays capped regardless of upload size.
//!
//! Parts larger than the configured in-memory thresholds are spilled to
//! temp files under the configured temp directory; the resulting
//! [`UploadedFile`] owns that file and removes it on drop. Long copies and
//! disk writes yield to the coroutine scheduler between chunks.
//!
//! ## Leniencies
//!
//! The parser follows RFC 7578 with the leniencies real clients need:
//! boundary values may be wrapped in single or double quotes, the first
//! occurrence of a duplicated field name wins, and the in-memory entry
//! point silently drops parts that are missing either `name` or
//! `filename`. A body whose closing delimiter never appears yields zero
//! files rather than a partial result.
//!
//! ## Memory discipline
//!
//! The from-file scanner never holds more than one read chunk plus a
//! search window of twice the longer delimiter. When a part outgrows
//! [`MultipartConfig::max_file_size_in_memory`] mid-stream, the bytes
//! accumulated so far are flushed to a fresh temp file and the part
//! continues on disk.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::http::upload::{unique_temp_path, FileMap, UploadedFile};
use memchr::memmem;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Prefix for multipart spill files under the temp directory.
pub(crate) const PARSE_SPILL_PREFIX: &str = "trellis_tmp";

/// In-memory copies above this size yield once to the scheduler.
const YIELD_THRESHOLD: usize = 64 * 1024;

/// Thresholds and chunk sizes for multipart parsing, normally derived from
/// the server configuration.
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Read cap for a single header line and the initial content reserve.
    pub chunk_size: usize,
    /// Chunk size for content reads and disk writes.
    pub chunk_size_disk: usize,
    /// Largest single part kept in memory.
    pub max_file_size_in_memory: usize,
    /// Cap on the combined size of in-memory parts for one body.
    pub max_files_size_in_memory: usize,
    /// Directory spill files are created in.
    pub tmp_dir: PathBuf,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16384,
            chunk_size_disk: 65536,
            max_file_size_in_memory: 1024 * 1024,
            max_files_size_in_memory: 10 * 1024 * 1024,
            tmp_dir: std::env::temp_dir(),
        }
    }
}

impl From<&ServerConfig> for MultipartConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            chunk_size: cfg.max_chunk_size,
            chunk_size_disk: cfg.max_chunk_size_disk,
            max_file_size_in_memory: cfg.max_file_size_in_memory,
            max_files_size_in_memory: cfg.max_files_size_in_memory,
            tmp_dir: cfg.tmp_dir.clone(),
        }
    }
}

/// Extract the boundary token from a `Content-Type` header value.
///
/// The header is split on `;`, each piece trimmed, and the first piece with
/// a case-insensitive `boundary=` prefix wins. One matched pair of single
/// or double quotes around the value is stripped.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    for part in content_type.split(';') {
        let part = part.trim();
        if part.len() >= 9 && part[..9].eq_ignore_ascii_case("boundary=") {
            let mut value = part[9..].trim().to_string();
            if value.len() >= 2 {
                let bytes = value.as_bytes();
                let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
                if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
                    value = value[1..value.len() - 1].to_string();
                }
            }
            return Some(value);
        }
    }
    None
}

fn validate_boundary(boundary: &str) -> Result<()> {
    if boundary.is_empty() {
        return Err(Error::processing("Empty boundary is not allowed"));
    }
    if boundary
        .chars()
        .next_back()
        .map(|c| c.is_whitespace())
        .unwrap_or(false)
    {
        return Err(Error::processing("Boundary can't end with whitespace"));
    }
    Ok(())
}

/// Name, filename and content type pulled out of one part's header block.
#[derive(Debug, Default)]
struct PartHeaders {
    name: String,
    filename: String,
    content_type: String,
}

fn extract_between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = s.find(start)? + start.len();
    let to = s[from..].find(end)? + from;
    Some(&s[from..to])
}

fn parse_part_headers(blob: &str) -> PartHeaders {
    let mut out = PartHeaders::default();
    for line in blob.split("\r\n") {
        let lower = line.to_ascii_lowercase();
        if lower.contains("content-disposition") {
            out.name = extract_between(line, "name=\"", "\"")
                .unwrap_or_default()
                .to_string();
            out.filename = extract_between(line, "filename=\"", "\"")
                .unwrap_or_default()
                .to_string();
        } else if lower.contains("content-type") {
            if let Some(colon) = line.find(':') {
                out.content_type = line[colon + 1..].trim().to_string();
            }
        }
    }
    out
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    memmem::find(&haystack[from..], needle).map(|i| i + from)
}

/// Yield to the coroutine scheduler when running inside one.
fn cooperative_yield() {
    if may::coroutine::is_coroutine() {
        may::coroutine::yield_now();
    }
}

fn create_spill_file(path: &Path) -> Result<fs::File> {
    fs::File::create(path)
        .map_err(|e| Error::processing(format!("Can't create temp file: {e}")))
}

/// Parse a multipart body held in memory.
///
/// Parts missing either `name` or `filename` are dropped silently, the
/// first part wins on duplicate field names, and a body whose closing
/// delimiter `--<boundary>--` never appears yields zero files.
pub fn parse(body: &[u8], boundary: &str, cfg: &MultipartConfig) -> Result<FileMap> {
    validate_boundary(boundary)?;

    let mut files = FileMap::new();

    let dash_boundary = format!("--{boundary}").into_bytes();
    let delimiter = format!("\r\n--{boundary}").into_bytes();

    if memmem::find(body, &dash_boundary).is_none() {
        return Ok(files);
    }

    let mut pos = 0usize;
    let mut in_memory_total = 0usize;
    let mut saw_closing = false;

    while let Some(hit) = find_from(body, &dash_boundary, pos) {
        pos = hit + dash_boundary.len();

        if body[pos..].starts_with(b"--") {
            saw_closing = true;
            break;
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let Some(header_end) = find_from(body, b"\r\n\r\n", pos) else {
            break;
        };
        let headers_blob = String::from_utf8_lossy(&body[pos..header_end]).into_owned();
        pos = header_end + 4;

        let part = parse_part_headers(&headers_blob);

        let Some(part_end) = find_from(body, &delimiter, pos) else {
            break;
        };
        let content = &body[pos..part_end];

        if !part.name.is_empty() && !part.filename.is_empty() {
            if content.len() <= cfg.max_file_size_in_memory
                && in_memory_total + content.len() <= cfg.max_files_size_in_memory
            {
                in_memory_total += content.len();
                if content.len() > YIELD_THRESHOLD {
                    cooperative_yield();
                }
                let file =
                    UploadedFile::in_memory(part.filename, part.content_type, content.to_vec());
                files.entry(part.name).or_insert(file);
            } else {
                let tmp = unique_temp_path(&cfg.tmp_dir, PARSE_SPILL_PREFIX);
                let mut out = create_spill_file(&tmp)?;
                for chunk in content.chunks(cfg.chunk_size_disk.max(1)) {
                    if let Err(e) = out.write_all(chunk) {
                        drop(out);
                        let _ = fs::remove_file(&tmp);
                        return Err(Error::processing(format!("Can't write temp file: {e}")));
                    }
                    cooperative_yield();
                }
                drop(out);
                let file = UploadedFile::on_disk(part.filename, part.content_type, tmp);
                files.entry(part.name).or_insert(file);
            }
        }

        // skip the CRLF so the next scan lands on the delimiter itself
        pos = part_end + 2;
    }

    if !saw_closing {
        files.clear();
        return Ok(files);
    }

    Ok(files)
}

/// Read one line from `source`, one byte at a time, capped at `limit`
/// bytes. Returns the line including its terminator, or an empty string at
/// end of input.
fn read_line(source: &mut fs::File, limit: usize) -> Result<String> {
    let mut buf: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    while buf.len() < limit {
        let n = source
            .read(&mut byte)
            .map_err(|e| Error::processing(format!("Error reading file: {e}")))?;
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn normalize_line(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}

/// Accumulates one part's content, in memory first and spilled to a temp
/// file once the in-memory cap is crossed.
struct PartSink<'a> {
    data: Vec<u8>,
    tmp_file: Option<fs::File>,
    tmp_path: Option<PathBuf>,
    written: usize,
    cfg: &'a MultipartConfig,
}

impl<'a> PartSink<'a> {
    /// Parts that arrived with a filename go straight to disk; the rest
    /// start in memory.
    fn new(start_on_disk: bool, cfg: &'a MultipartConfig) -> Result<Self> {
        let mut sink = Self {
            data: Vec::new(),
            tmp_file: None,
            tmp_path: None,
            written: 0,
            cfg,
        };
        if start_on_disk {
            sink.open_spill()?;
        } else {
            sink.data.reserve(cfg.chunk_size);
        }
        Ok(sink)
    }

    fn in_memory(&self) -> bool {
        self.tmp_file.is_none()
    }

    fn open_spill(&mut self) -> Result<()> {
        let path = unique_temp_path(&self.cfg.tmp_dir, PARSE_SPILL_PREFIX);
        let mut file = create_spill_file(&path)?;
        if !self.data.is_empty() {
            file.write_all(&self.data)
                .map_err(|e| Error::processing(format!("Can't write temp file: {e}")))?;
            cooperative_yield();
            self.data = Vec::new();
        }
        self.tmp_file = Some(file);
        self.tmp_path = Some(path);
        Ok(())
    }

    /// Append content bytes. With `spill_check` the in-memory cap is
    /// enforced first; the end-of-input flush writes unconditionally.
    fn write(&mut self, bytes: &[u8], spill_check: bool) -> Result<()> {
        if spill_check
            && self.in_memory()
            && self.written + bytes.len() > self.cfg.max_file_size_in_memory
        {
            self.open_spill()?;
        }
        match &mut self.tmp_file {
            None => self.data.extend_from_slice(bytes),
            Some(file) => {
                file.write_all(bytes)
                    .map_err(|e| Error::processing(format!("Can't write temp file: {e}")))?;
                cooperative_yield();
            }
        }
        self.written += bytes.len();
        Ok(())
    }

    /// Close the spill file (when any) and produce the uploaded file.
    /// In-memory parts use the field name as their display name since no
    /// filename was supplied.
    fn finish(mut self, field_name: &str, filename: String, content_type: String) -> UploadedFile {
        drop(self.tmp_file.take());
        cooperative_yield();
        match self.tmp_path.take() {
            None => UploadedFile::in_memory(field_name, content_type, std::mem::take(&mut self.data)),
            Some(path) => UploadedFile::on_disk(filename, content_type, path),
        }
    }
}

/// Parse a multipart body that was spilled to `path`.
///
/// Headers are read line-wise; content is scanned through a rolling search
/// buffer bounded at twice the longer delimiter, rewinding the source file
/// past each delimiter found. All failure modes (missing initial boundary,
/// unterminated headers, part without a name, I/O errors) surface as
/// [`Error::Processing`].
pub fn parse_file(path: &Path, boundary: &str, cfg: &MultipartConfig) -> Result<FileMap> {
    validate_boundary(boundary)?;

    let mut source = fs::File::open(path)
        .map_err(|e| Error::processing(format!("Can't open input file: {e}")))?;

    let dash_boundary = format!("--{boundary}");
    let delimiter = format!("\r\n--{boundary}").into_bytes();
    let closing_delimiter = format!("\r\n--{boundary}--").into_bytes();
    let max_window = delimiter.len().max(closing_delimiter.len()) * 2;

    let mut files = FileMap::new();

    // 1. skip preamble lines until the initial boundary
    loop {
        let line = read_line(&mut source, cfg.chunk_size)?;
        if line.is_empty() {
            return Err(Error::processing(
                "Invalid format, initial boundary not found",
            ));
        }
        if normalize_line(&line) == dash_boundary {
            break;
        }
    }

    let mut chunk = vec![0u8; cfg.chunk_size_disk.max(1)];

    loop {
        // 2a. part headers up to the blank line
        let mut headers_blob = String::new();
        let mut terminated = false;
        loop {
            let line = read_line(&mut source, cfg.chunk_size)?;
            if line.is_empty() {
                break;
            }
            let normalized = normalize_line(&line);
            if normalized.is_empty() {
                terminated = true;
                break;
            }
            headers_blob.push_str(normalized);
            headers_blob.push_str("\r\n");
        }
        if !terminated {
            return Err(Error::processing(
                "Headers section is not properly terminated",
            ));
        }

        // 2b. disposition fields
        let part = parse_part_headers(&headers_blob);
        if part.name.is_empty() {
            return Err(Error::processing(
                "Missing name parameter in Content-Disposition header",
            ));
        }

        // 2c. initial target
        let mut sink = PartSink::new(!part.filename.is_empty(), cfg)?;

        // 2d–2h. content scan through the rolling buffer
        let mut search: Vec<u8> = Vec::with_capacity(max_window + chunk.len());
        let mut found_boundary = false;
        let mut is_final = false;

        while !found_boundary {
            let n = source
                .read(&mut chunk)
                .map_err(|e| Error::processing(format!("Error reading file: {e}")))?;

            if n == 0 {
                if !search.is_empty() {
                    sink.write(&search, false)?;
                    search.clear();
                }
                break;
            }

            search.extend_from_slice(&chunk[..n]);

            if let Some(p) = memmem::find(&search, &delimiter) {
                // the plain delimiter is a prefix of the closing one, so a
                // match is closing iff the two trailing dashes follow
                let final_here = search[p..].starts_with(&closing_delimiter);
                if p > 0 {
                    sink.write(&search[..p], true)?;
                }
                let delim_len = if final_here {
                    closing_delimiter.len()
                } else {
                    delimiter.len()
                };
                let rewind = search.len() - (p + delim_len);
                if rewind > 0 {
                    source
                        .seek(SeekFrom::Current(-(rewind as i64)))
                        .map_err(|e| Error::processing(format!("Error seeking in file: {e}")))?;
                }
                found_boundary = true;
                is_final = final_here;
            } else if search.len() > max_window {
                let flush = search.len() - max_window;
                sink.write(&search[..flush], true)?;
                search.drain(..flush);
            }
        }

        // 3. record the completed part, first occurrence wins
        let file = sink.finish(&part.name, part.filename, part.content_type);
        files.entry(part.name).or_insert(file);

        if is_final {
            break;
        }

        // the matched delimiter's trailing CRLF is still pending; consume
        // it so the next header phase starts on the first header line
        let _ = read_line(&mut source, cfg.chunk_size)?;
    }

    Ok(files)
}
