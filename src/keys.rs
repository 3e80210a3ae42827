//! Private key discovery for credential candidates.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

const KEY_PREFIXES: &[&str] = &["id_dsa", "id_rsa", "id_ecdsa", "id_ed25519"];

/// Raised when a key directory cannot be listed.
#[derive(Debug, Error)]
#[error("failed to list key directory {path}: {message}")]
pub struct KeyDirError {
    /// Directory that failed.
    pub path: Utf8PathBuf,
    /// Operating system error string.
    pub message: String,
}

impl KeyDirError {
    fn new(path: &Utf8Path, err: &io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use fleetroll::keys::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Returns `true` for file names that look like OpenSSH private keys.
#[must_use]
pub fn is_private_key_name(name: &str) -> bool {
    !name.ends_with(".pub") && KEY_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Lists private key files in `dir`, sorted by name.
///
/// Sub-directories, public keys and names in `blacklist` are skipped.
///
/// # Errors
///
/// Returns [`KeyDirError`] when the directory cannot be opened or read.
pub fn discover_keys(dir: &Utf8Path, blacklist: &[String]) -> Result<Vec<Utf8PathBuf>, KeyDirError> {
    let handle =
        Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| KeyDirError::new(dir, &err))?;
    let mut names = Vec::new();
    for item in handle.entries().map_err(|err| KeyDirError::new(dir, &err))? {
        let entry = item.map_err(|err| KeyDirError::new(dir, &err))?;
        if !entry
            .file_type()
            .map_err(|err| KeyDirError::new(dir, &err))?
            .is_file()
        {
            continue;
        }
        let name = entry.file_name().map_err(|err| KeyDirError::new(dir, &err))?;
        if is_private_key_name(&name) && !blacklist.contains(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names.into_iter().map(|name| dir.join(name)).collect())
}
