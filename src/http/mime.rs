//! MIME type lookup for file responses, keyed on the lowercased file
//! extension including the leading dot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Fallback for unknown extensions.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const MIME_ENTRIES: [(&str, &str); 60] = [
    (".html", "text/html"),
    (".htm", "text/html"),
    (".css", "text/css"),
    (".js", "application/javascript"),
    (".json", "application/json"),
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".gif", "image/gif"),
    (".svg", "image/svg+xml"),
    (".ico", "image/x-icon"),
    (".pdf", "application/pdf"),
    (".txt", "text/plain"),
    (".xml", "application/xml"),
    (".mp3", "audio/mpeg"),
    (".mp4", "video/mp4"),
    (".webm", "video/webm"),
    (".woff", "font/woff"),
    (".woff2", "font/woff2"),
    (".ttf", "font/ttf"),
    (".otf", "font/otf"),
    (".zip", "application/zip"),
    (".gz", "application/gzip"),
    (".tar", "application/x-tar"),
    (".csv", "text/csv"),
    (".doc", "application/msword"),
    (
        ".docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    (".xls", "application/vnd.ms-excel"),
    (
        ".xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    (".ppt", "application/vnd.ms-powerpoint"),
    (
        ".pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    (".avi", "video/x-msvideo"),
    (".bmp", "image/bmp"),
    (".epub", "application/epub+zip"),
    (".flv", "video/x-flv"),
    (".m4a", "audio/mp4"),
    (".m4v", "video/mp4"),
    (".mkv", "video/x-matroska"),
    (".ogg", "audio/ogg"),
    (".ogv", "video/ogg"),
    (".oga", "audio/ogg"),
    (".opus", "audio/opus"),
    (".wav", "audio/wav"),
    (".webp", "image/webp"),
    (".tiff", "image/tiff"),
    (".tif", "image/tiff"),
    (".md", "text/markdown"),
    (".markdown", "text/markdown"),
    (".yaml", "application/yaml"),
    (".yml", "application/yaml"),
    (".rar", "application/vnd.rar"),
    (".7z", "application/x-7z-compressed"),
    (".apk", "application/vnd.android.package-archive"),
    (".exe", "application/x-msdownload"),
    (".dll", "application/x-msdownload"),
    (".swf", "application/x-shockwave-flash"),
    (".rtf", "application/rtf"),
    (".eot", "application/vnd.ms-fontobject"),
    (".ps", "application/postscript"),
    (".sqlite", "application/x-sqlite3"),
];

fn mime_map() -> &'static HashMap<&'static str, &'static str> {
    static MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| MIME_ENTRIES.iter().copied().collect())
}

/// Look up the MIME type for a path by extension. Extension matching is
/// case-insensitive; paths without a known extension fall back to
/// [`DEFAULT_MIME_TYPE`].
pub fn mime_type(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!(".{}", ext.to_ascii_lowercase()),
        _ => return DEFAULT_MIME_TYPE,
    };
    mime_map().get(ext.as_str()).copied().unwrap_or(DEFAULT_MIME_TYPE)
}
