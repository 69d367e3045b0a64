//! Credentials and password hashing
//!
//! The server never sees clear text passwords. The client sends the
//! lowercase hex SHA-512 digest of the user name immediately followed by
//! the password.

use sha2::{Digest, Sha512};
use std::fmt;

use crate::protocol::{Request, RequestType, PASSWORD, USERNAME};

/// Computes the transmitted form of a password.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialHasher;

impl CredentialHasher {
    pub fn hash(&self, user: &str, password: &str) -> String {
        let mut hasher = Sha512::new();
        hasher.update(user.as_bytes());
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// User credentials, either clear text or already hashed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    secret: String,
    hashed: bool,
}

impl Credentials {
    /// Clear text credentials, hashed before they are sent.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: password.into(),
            hashed: false,
        }
    }

    /// Credentials whose password is already in its transmitted form.
    pub fn prehashed(user: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: hash.into(),
            hashed: true,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_hashed(&self) -> bool {
        self.hashed
    }

    /// These credentials with the password in transmitted form.
    pub fn hashed(self, hasher: &CredentialHasher) -> Self {
        if self.hashed {
            return self;
        }
        let secret = hasher.hash(&self.user, &self.secret);
        Self {
            user: self.user,
            secret,
            hashed: true,
        }
    }

    /// The authentication request for these credentials.
    ///
    /// Clear text credentials are hashed on the fly.
    pub fn authentication_request(&self) -> Request {
        let password = if self.hashed {
            self.secret.clone()
        } else {
            CredentialHasher.hash(&self.user, &self.secret)
        };
        Request::new(RequestType::Authentication)
            .with_parameter(USERNAME, self.user.clone())
            .with_parameter(PASSWORD, password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .field("hashed", &self.hashed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_sha512_hex_of_concatenation() {
        let hasher = CredentialHasher;
        let hash = hasher.hash("admin", "secret");

        assert_eq!(hash.len(), 128);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, hex::encode(Sha512::digest(b"adminsecret")));
        assert_ne!(hash, hasher.hash("admin", "Secret"));
    }

    #[test]
    fn test_hash_of_empty_input() {
        assert_eq!(
            CredentialHasher.hash("", ""),
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
             47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
        );
    }

    #[test]
    fn test_authentication_request() {
        let creds = Credentials::new("admin", "secret");
        let request = creds.authentication_request();
        assert_eq!(request.kind, RequestType::Authentication);
        assert_eq!(request.parameter(USERNAME), Some(&json!("admin")));
        assert_eq!(
            request.parameter(PASSWORD),
            Some(&json!(CredentialHasher.hash("admin", "secret")))
        );
    }

    #[test]
    fn test_prehashed_passes_through() {
        let creds = Credentials::prehashed("admin", "abc123");
        let request = creds.authentication_request();
        assert_eq!(request.parameter(PASSWORD), Some(&json!("abc123")));

        let same = creds.clone().hashed(&CredentialHasher);
        assert_eq!(same, creds);
    }

    #[test]
    fn test_hashing_once_keeps_request_stable() {
        let raw = Credentials::new("admin", "secret");
        let hashed = raw.clone().hashed(&CredentialHasher);
        assert!(hashed.is_hashed());
        assert_eq!(
            hashed.authentication_request(),
            raw.authentication_request()
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let text = format!("{:?}", Credentials::new("admin", "hunter2"));
        assert!(text.contains("admin"));
        assert!(!text.contains("hunter2"));
    }
}
