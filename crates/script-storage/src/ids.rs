//! Object identifiers and the storage key layout derived from them

use uuid::Uuid;

/// Cache-only prefix marking the decompressed variant of an object
pub const DECOMPRESSED_PREFIX: &str = "DECOMPRESSED:";

const META_PREFIX: &str = "META:";
const SCRIPT_PREFIX: &str = "00-";

/// Generate a fresh full script id, e.g. `00-<uuid>.js`
pub fn new_script_id() -> String {
    format!("{}.js", new_pure_id())
}

/// Generate a fresh pure id, e.g. `00-<uuid>`
pub fn new_pure_id() -> String {
    format!("{}{}", SCRIPT_PREFIX, Uuid::new_v4())
}

/// Strip a trailing 2-3 character extension and the decompressed prefix.
///
/// `DECOMPRESSED:00-abc.js` and `00-abc.map` both become `00-abc`.
pub fn pure_id(id: &str) -> &str {
    let id = id.strip_prefix(DECOMPRESSED_PREFIX).unwrap_or(id);
    match id.rfind('.') {
        Some(dot) if (3..=4).contains(&(id.len() - dot)) => &id[..dot],
        _ => id,
    }
}

pub fn is_map_id(id: &str) -> bool {
    id.ends_with(".map")
}

/// Full id shape: `00-` followed by a UUID and `.js`
pub fn is_full_script_id(id: &str) -> bool {
    id.strip_prefix(SCRIPT_PREFIX)
        .and_then(|rest| rest.strip_suffix(".js"))
        .map(|uuid| Uuid::parse_str(uuid).is_ok())
        .unwrap_or(false)
}

pub(crate) fn meta_key(id: &str) -> String {
    format!("{}{}", META_PREFIX, pure_id(id))
}

pub(crate) fn script_key(id: &str) -> String {
    format!("{}.js", pure_id(id))
}

pub(crate) fn map_key(id: &str) -> String {
    format!("{}.map", pure_id(id))
}
