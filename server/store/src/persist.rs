//! Atomic JSON persistence helpers: write to `<path>.tmp`, then rename.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

/// Load a `{string: string}` JSON object; a missing or unreadable file
/// yields an empty map, matching a fresh deployment.
pub(crate) fn load_map(path: &Path) -> BTreeMap<String, String> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_slice(&data) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unparseable store file");
            BTreeMap::new()
        }
    }
}

pub(crate) fn write_map(path: &Path, map: &BTreeMap<String, String>) -> io::Result<()> {
    let mut data = serde_json::to_vec_pretty(map).map_err(io::Error::other)?;
    data.push(b'\n');
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &data)?;
    fs::rename(&tmp, path)
}
