//! Credential file loading.
//!
//! The file holds one `login:password` pair per line. Lines without a
//! colon are ignored. Only logins are retained: the digest is checked
//! against the server-held secret in `auth`, not against this file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Cannot open auth file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Read-only set of known logins, loaded once at startup.
#[derive(Debug, Default, Clone)]
pub struct CredentialStore {
    logins: HashSet<String>,
}

impl CredentialStore {
    pub fn load(path: &Path) -> Result<Self, CredentialError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::parse(&contents);
        debug!(path = %path.display(), entries = store.len(), "Loaded credentials");
        Ok(store)
    }

    /// Parse file contents. The login ends at the first `:`, so
    /// passwords may contain colons.
    pub fn parse(contents: &str) -> Self {
        let logins = contents
            .lines()
            .filter_map(|line| {
                let line = line.strip_suffix('\r').unwrap_or(line);
                line.split_once(':').map(|(login, _)| login.to_string())
            })
            .collect();
        Self { logins }
    }

    pub fn contains(&self, login: &str) -> bool {
        self.logins.contains(login)
    }

    pub fn len(&self) -> usize {
        self.logins.len()
    }
}
