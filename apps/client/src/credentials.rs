//! Credential sources: read-only bearer token lookup shared by both components.
//!
//! Neither the connection manager nor the login controller ever writes a token.
//! Storage belongs to whoever bootstraps the application.

use std::sync::RwLock;

/// Synchronous getter for the current bearer token.
/// Each call is a fresh snapshot; callers must not cache the result.
pub trait CredentialSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Env var checked first, then the legacy fallback key.
const TOKEN_ENV_KEYS: [&str; 2] = ["SYNC_TOKEN", "AUTH_TOKEN"];

/// Reads the token from the process environment on every call, so a token
/// exported after startup is picked up by the next connect attempt.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn token(&self) -> Option<String> {
        TOKEN_ENV_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

/// In-process token store. The application sets it after login; components read it.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    token: RwLock<Option<String>>,
}

#[allow(dead_code)]
impl MemoryCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }
}

impl CredentialSource for MemoryCredentials {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_credentials_set_and_clear() {
        let creds = MemoryCredentials::default();
        assert_eq!(creds.token(), None);

        creds.set("abc");
        assert_eq!(creds.token().as_deref(), Some("abc"));

        creds.clear();
        assert_eq!(creds.token(), None);
    }

    #[test]
    fn test_memory_credentials_treats_empty_as_missing() {
        let creds = MemoryCredentials::new(Some(String::new()));
        assert_eq!(creds.token(), None);
    }
}
