//! Salted SHA-224 challenge verification.
//!
//! A client proves knowledge of the account secret by sending
//! `hex(SHA224(salt || secret))` together with the salt it chose.

use sha2::{Digest, Sha224};

/// The only account the service recognizes.
pub const ACCOUNT_NAME: &str = "user";

/// Server-held secret for [`ACCOUNT_NAME`].
pub const ACCOUNT_SECRET: &str = "P@ssW0rd";

/// Checks client-supplied digests against the server-held secret.
#[derive(Debug, Clone)]
pub struct HashVerifier {
    account: String,
    secret: String,
}

impl Default for HashVerifier {
    fn default() -> Self {
        Self::new(ACCOUNT_NAME, ACCOUNT_SECRET)
    }
}

impl HashVerifier {
    pub fn new(account: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            secret: secret.into(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Upper-case hex digest a client with the right secret would send for `salt`.
    pub fn expected_digest(&self, salt: &[u8]) -> String {
        let mut hasher = Sha224::new();
        hasher.update(salt);
        hasher.update(self.secret.as_bytes());
        hex::encode_upper(hasher.finalize())
    }

    /// Returns true only when the trimmed login names the account and
    /// `claimed_hash` matches the expected digest, ignoring ASCII case.
    ///
    /// Trailing spaces are stripped from `login`: some clients pad it to the
    /// fixed field width. Unknown logins are rejected before hashing.
    pub fn verify(&self, login: &[u8], salt: &[u8], claimed_hash: &[u8]) -> bool {
        let end = login
            .iter()
            .rposition(|&b| b != b' ')
            .map_or(0, |pos| pos + 1);
        if &login[..end] != self.account.as_bytes() {
            return false;
        }

        self.expected_digest(salt)
            .as_bytes()
            .eq_ignore_ascii_case(claimed_hash)
    }
}
