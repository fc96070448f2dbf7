//! Session keys: the (identity, chain) pair every storage handle and worker
//! process is registered under.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum accepted identity length. Identities are opaque strings minted by
/// the wallet shell; anything longer is a caller bug.
const MAX_IDENTITY_LEN: usize = 128;

/// Network-selection discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Main,
    Test,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Main => "main",
            Chain::Test => "test",
        }
    }

    /// Database filename for this chain. One file per chain, shared by all
    /// identities; rows are scoped by identity inside the schema.
    pub fn db_file_name(&self) -> &'static str {
        match self {
            Chain::Main => "wallet-main.sqlite",
            Chain::Test => "wallet-test.sqlite",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Chain::Main),
            "test" => Ok(Chain::Test),
            other => Err(InvalidKey::UnknownChain(other.to_string())),
        }
    }
}

/// Why a session key was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidKey {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("identity exceeds {MAX_IDENTITY_LEN} characters")]
    IdentityTooLong,
    #[error("identity contains a forbidden character: {0:?}")]
    ForbiddenCharacter(char),
    #[error("unknown chain: {0}")]
    UnknownChain(String),
}

/// Composite key for one wallet identity on one chain. Used consistently as
/// the map key by the registry, the storage factory, and the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub identity: String,
    pub chain: Chain,
}

impl SessionKey {
    /// Validates the identity and builds a key. Identities end up inside SQL
    /// rows and log lines, never in filenames, but path separators and
    /// control characters are still rejected outright.
    pub fn new(identity: impl Into<String>, chain: Chain) -> Result<Self, InvalidKey> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(InvalidKey::EmptyIdentity);
        }
        if identity.len() > MAX_IDENTITY_LEN {
            return Err(InvalidKey::IdentityTooLong);
        }
        if let Some(bad) = identity
            .chars()
            .find(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
        {
            return Err(InvalidKey::ForbiddenCharacter(bad));
        }
        Ok(Self { identity, chain })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_identities() {
        let key = SessionKey::new("abc", Chain::Main).unwrap();
        assert_eq!(key.identity, "abc");
        assert_eq!(key.chain, Chain::Main);
        assert_eq!(key.to_string(), "abc@main");
    }

    #[test]
    fn rejects_empty_identity() {
        assert_eq!(
            SessionKey::new("", Chain::Test),
            Err(InvalidKey::EmptyIdentity)
        );
    }

    #[test]
    fn rejects_path_separators_and_control_chars() {
        assert!(matches!(
            SessionKey::new("a/b", Chain::Main),
            Err(InvalidKey::ForbiddenCharacter('/'))
        ));
        assert!(matches!(
            SessionKey::new("a\\b", Chain::Main),
            Err(InvalidKey::ForbiddenCharacter('\\'))
        ));
        assert!(matches!(
            SessionKey::new("a\nb", Chain::Main),
            Err(InvalidKey::ForbiddenCharacter('\n'))
        ));
    }

    #[test]
    fn rejects_oversized_identity() {
        let long = "x".repeat(MAX_IDENTITY_LEN + 1);
        assert_eq!(
            SessionKey::new(long, Chain::Main),
            Err(InvalidKey::IdentityTooLong)
        );
    }

    #[test]
    fn keys_with_same_parts_are_equal() {
        let a = SessionKey::new("abc", Chain::Main).unwrap();
        let b = SessionKey::new("abc", Chain::Main).unwrap();
        let c = SessionKey::new("abc", Chain::Test).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn chain_parses_and_names_db_files() {
        assert_eq!("main".parse::<Chain>().unwrap(), Chain::Main);
        assert_eq!("test".parse::<Chain>().unwrap(), Chain::Test);
        assert!("regtest".parse::<Chain>().is_err());
        assert_eq!(Chain::Main.db_file_name(), "wallet-main.sqlite");
        assert_eq!(Chain::Test.db_file_name(), "wallet-test.sqlite");
    }
}
