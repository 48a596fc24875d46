//! Tag registry for outbound connections.
//!
//! A tag maps to a `host port` pair stored as a flat file in the state
//! directory (`ARCAN_STATEPATH`). The on-disk layout is deliberately dumb:
//! one file per tag, first line `host port`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default port when a registration or outbound form omits one.
pub const DEFAULT_PORT: u16 = 6680;

/// Resolve the keystore directory from the environment.
pub fn statepath() -> Option<PathBuf> {
    std::env::var_os("ARCAN_STATEPATH").map(PathBuf::from)
}

fn tag_path(dir: &Path, tag: &str) -> io::Result<PathBuf> {
    if tag.is_empty() || tag.contains('/') || tag.starts_with('.') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid keystore tag",
        ));
    }
    Ok(dir.join(tag))
}

/// Register (or replace) `tag` as `host:port`.
pub fn register(dir: &Path, tag: &str, host: &str, port: u16) -> io::Result<()> {
    if host.is_empty() || port == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid host or port",
        ));
    }
    fs::create_dir_all(dir)?;
    let path = tag_path(dir, tag)?;
    fs::write(path, format!("{host} {port}\n"))
}

/// Look `tag` up. `Ok(None)` when it was never registered.
pub fn lookup(dir: &Path, tag: &str) -> io::Result<Option<(String, u16)>> {
    let path = tag_path(dir, tag)?;
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut fields = contents.split_whitespace();
    let host = fields.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "malformed keystore entry")
    })?;
    let port = fields
        .next()
        .unwrap_or("")
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed keystore port"))?;

    Ok(Some((host.to_owned(), port)))
}
