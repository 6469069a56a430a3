//! Content-type detection for uploads that did not declare one

pub const JAVASCRIPT: &str = "text/javascript";
pub const X_JAVASCRIPT: &str = "application/x-javascript";
pub const ZIP: &str = "application/zip";

/// MIME types an upload may declare
pub const ALLOWED_TYPES: [&str; 3] = [JAVASCRIPT, X_JAVASCRIPT, ZIP];

/// Upload shape after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Script,
    Archive,
}

/// Leading bytes of the binary formats we recognise
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"PK\x03\x04", ZIP),
    (b"PK\x05\x06", ZIP),
    (b"\x1f\x8b", "application/gzip"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"\x00asm", "application/wasm"),
    (b"BZh", "application/x-bzip2"),
    (b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    (b"Rar!\x1a\x07", "application/vnd.rar"),
    (b"\x7fELF", "application/x-executable"),
];

/// Number of leading bytes [`sniff`] needs to see
pub const SNIFF_LEN: usize = 8;

/// Best guess at a MIME type from content, `None` when nothing matched
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    SIGNATURES
        .iter()
        .find(|(magic, _)| head.starts_with(magic))
        .map(|(_, mime)| *mime)
}

/// Strip parameters and normalise case, e.g. `Text/JavaScript; charset=utf-8`
fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Classify a declared MIME type, `None` when it is not accepted
pub fn classify_declared(mime: &str) -> Option<UploadKind> {
    match essence(mime).as_str() {
        JAVASCRIPT | X_JAVASCRIPT => Some(UploadKind::Script),
        ZIP => Some(UploadKind::Archive),
        _ => None,
    }
}

/// Classify undeclared content; an inconclusive sniff counts as script
pub fn classify_sniffed(head: &[u8]) -> Result<UploadKind, &'static str> {
    match sniff(head) {
        None => Ok(UploadKind::Script),
        Some(ZIP) => Ok(UploadKind::Archive),
        Some(other) => Err(other),
    }
}
