//! Best-effort MIME type inference from a file name.

/// Fallback when the extension is unknown or missing.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Guess the MIME type of `name` from its extension (case-insensitive).
/// Only the name is inspected, never the bytes.
pub fn detect(name: &str) -> &'static str {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let Some((stem, ext)) = file_name.rsplit_once('.') else {
        return DEFAULT_CONTENT_TYPE;
    };
    if stem.is_empty() {
        // dotfiles like `.env` have no extension
        return DEFAULT_CONTENT_TYPE;
    }

    match ext.to_ascii_lowercase().as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odt" => "application/vnd.oasis.opendocument.text",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "rtf" => "application/rtf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "gaeb" | "x83" | "x84" | "x86" => "application/xml",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "dwg" => "image/vnd.dwg",
        "dxf" => "image/vnd.dxf",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
