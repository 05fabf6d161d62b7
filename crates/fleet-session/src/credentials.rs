use std::collections::HashMap;
use std::sync::Mutex;

/// Service key for the Fly Machines API token.
pub const FLY_API_TOKEN: &str = "fly-api-token";

/// Service key for the bearer token the agent stream expects.
pub const AGENT_AUTH_TOKEN: &str = "agent-auth-token";

/// Secure credential storage, keyed by fixed service identifiers.
pub trait CredentialStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;

    /// Returns `false` if the secret could not be stored.
    fn set(&self, key: &str, secret: &str) -> bool;

    /// Returns `false` if there was nothing to delete.
    fn delete(&self, key: &str) -> bool;
}

/// Process-local credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from `FLY_API_TOKEN` and `AGENT_AUTH_TOKEN` when present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let store = Self::new();
        for (var, key) in [("FLY_API_TOKEN", FLY_API_TOKEN), ("AGENT_AUTH_TOKEN", AGENT_AUTH_TOKEN)] {
            match std::env::var(var) {
                Ok(secret) if !secret.is_empty() => {
                    store.set(key, &secret);
                }
                _ => tracing::debug!(var, "credential not set in environment"),
            }
        }
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.secrets.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, secret: &str) -> bool {
        match self.secrets.lock() {
            Ok(mut secrets) => {
                secrets.insert(key.to_string(), secret.to_string());
                true
            }
            Err(_) => false,
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.secrets
            .lock()
            .map(|mut secrets| secrets.remove(key).is_some())
            .unwrap_or(false)
    }
}

/// Token presented to the agent stream: the dedicated agent token if there is
/// one, otherwise the API token.
pub fn stream_token(store: &dyn CredentialStore) -> Option<String> {
    store.get(AGENT_AUTH_TOKEN).or_else(|| store.get(FLY_API_TOKEN))
}
