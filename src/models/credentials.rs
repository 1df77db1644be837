use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use tracing::debug;

use crate::error::{Error, Result};

/// A provider access secret plus its position in the pool. Lives for the
/// process lifetime; never persisted by this layer.
#[derive(Clone)]
pub struct Credential {
    index: usize,
    secret: String,
}

impl Credential {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Ordered set of interchangeable credentials with a shared rotation cursor.
///
/// The cursor starts at a pseudo-random offset so independent client
/// processes sharing one credential set do not all hammer index 0 at once,
/// and it persists across logical requests. Rotation within a single
/// request is driven by the orchestrator.
pub struct CredentialPool {
    credentials: Vec<Credential>,
    start: usize,
    cursor: Mutex<usize>,
}

impl CredentialPool {
    pub fn new(secrets: Vec<String>) -> Result<Self> {
        if secrets.is_empty() {
            return Err(Error::validation("credential pool cannot be empty"));
        }

        let start = rand::thread_rng().gen_range(0..secrets.len());
        Self::with_start(secrets, start)
    }

    /// Deterministic construction with an explicit cold-start cursor.
    pub fn with_start(secrets: Vec<String>, start: usize) -> Result<Self> {
        if secrets.is_empty() {
            return Err(Error::validation("credential pool cannot be empty"));
        }
        if start >= secrets.len() {
            return Err(Error::validation(format!(
                "start cursor {} out of range for pool of {}",
                start,
                secrets.len()
            )));
        }

        let credentials = secrets
            .into_iter()
            .enumerate()
            .map(|(index, secret)| Credential { index, secret })
            .collect::<Vec<_>>();

        debug!(size = credentials.len(), start, "credential pool initialized");

        Ok(Self {
            credentials,
            start,
            cursor: Mutex::new(start),
        })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn active(&self) -> Credential {
        self.credentials[*self.cursor.lock()].clone()
    }

    /// Advances the cursor modulo pool size and returns the new active
    /// credential.
    pub fn rotate(&self) -> Credential {
        let mut cursor = self.cursor.lock();
        *cursor = (*cursor + 1) % self.credentials.len();
        debug!(cursor = *cursor, "rotated to next credential");
        self.credentials[*cursor].clone()
    }

    /// Returns the cursor to the pool's cold-start position. Called when the
    /// fallback chain advances to a new model so every credential gets a
    /// chance against it.
    pub fn reset_to_start(&self) {
        *self.cursor.lock() = self.start;
    }

    pub fn cursor(&self) -> usize {
        *self.cursor.lock()
    }
}
