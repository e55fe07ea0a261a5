//! Decryption credentials passed through to the collaborator.
//!
//! tack does not interpret keys; it only encodes the method prefix the
//! collaborator expects and keeps secrets out of logs.

use std::collections::BTreeMap;

/// How a decryption secret should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionMethod {
    BitlockerPassword,
    BitlockerRecoveryKey,
    BitlockerFvekTweak,
    LuksPassphrase,
}

impl DecryptionMethod {
    /// Parse the human label used by front-ends.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "bitlocker password" => Some(Self::BitlockerPassword),
            "bitlocker recovery key" => Some(Self::BitlockerRecoveryKey),
            "bitlocker full volume encryption and tweak key" => Some(Self::BitlockerFvekTweak),
            "luks passphrase" => Some(Self::LuksPassphrase),
            _ => None,
        }
    }

    fn prefix(self) -> char {
        match self {
            Self::BitlockerPassword | Self::LuksPassphrase => 'p',
            Self::BitlockerRecoveryKey => 'r',
            Self::BitlockerFvekTweak => 'k',
        }
    }
}

/// A secret together with its method.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptionKey {
    method: DecryptionMethod,
    secret: String,
}

impl DecryptionKey {
    pub fn new(method: DecryptionMethod, secret: impl Into<String>) -> Self {
        Self { method, secret: secret.into() }
    }

    /// Encode as `<prefix>:<secret>`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.method.prefix(), self.secret)
    }
}

impl std::fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey").field("method", &self.method).finish_non_exhaustive()
    }
}

/// Encoded keys by volume index.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    keys: BTreeMap<u32, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials with one key for the given volume.
    pub fn single(index: u32, key: &DecryptionKey) -> Self {
        let mut creds = Self::new();
        creds.insert(index, key);
        creds
    }

    pub fn insert(&mut self, index: u32, key: &DecryptionKey) {
        self.keys.insert(index, key.encode());
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Encoded keys in volume order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.keys.iter().map(|(i, k)| (*i, k.as_str()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("volumes", &self.keys.keys().collect::<Vec<_>>()).finish()
    }
}
