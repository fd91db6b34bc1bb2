//! Command Authentication
//!
//! HMAC-SHA256 over `version|checksum|url`, keyed with the pre-shared
//! signing secret. Binding all three fields stops a captured command from
//! being replayed with a substituted URL or version.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

use super::command::UpdateCommand;

type HmacSha256 = Hmac<Sha256>;

/// Separator between the signed fields
pub const FIELD_SEPARATOR: char = '|';

/// Result of authenticating one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    RejectedMissingSignature,
    RejectedSignatureMismatch,
}

impl AuthOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl fmt::Display for AuthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::RejectedMissingSignature => write!(f, "missing signature"),
            Self::RejectedSignatureMismatch => write!(f, "signature mismatch"),
        }
    }
}

/// Canonical string the tag is computed over
pub fn canonical_message(version: &str, checksum: &str, url: &str) -> String {
    format!("{version}{FIELD_SEPARATOR}{checksum}{FIELD_SEPARATOR}{url}")
}

/// Stateless validator holding the shared secret and the enforcement policy
#[derive(Clone)]
pub struct CommandAuthenticator {
    secret: Vec<u8>,
    enforce: bool,
}

impl fmt::Debug for CommandAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAuthenticator")
            .field("secret", &"<redacted>")
            .field("enforce", &self.enforce)
            .finish()
    }
}

impl CommandAuthenticator {
    pub fn new(secret: impl AsRef<[u8]>, enforce: bool) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            enforce,
        }
    }

    /// Authenticator that accepts every command
    pub fn disabled() -> Self {
        Self::new(b"", false)
    }

    pub fn is_enforced(&self) -> bool {
        self.enforce
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).ok()
    }

    /// Lowercase hex tag for the given fields
    pub fn sign(&self, version: &str, checksum: &str, url: &str) -> String {
        let Some(mut mac) = self.mac() else {
            return String::new();
        };
        mac.update(canonical_message(version, checksum, url).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a hex tag against the given fields
    pub fn verify_fields(&self, version: &str, checksum: &str, url: &str, tag: &str) -> AuthOutcome {
        let Ok(tag_bytes) = hex::decode(tag.trim()) else {
            return AuthOutcome::RejectedSignatureMismatch;
        };

        let Some(mut mac) = self.mac() else {
            return AuthOutcome::RejectedSignatureMismatch;
        };
        mac.update(canonical_message(version, checksum, url).as_bytes());
        match mac.verify_slice(&tag_bytes) {
            Ok(()) => AuthOutcome::Accepted,
            Err(_) => AuthOutcome::RejectedSignatureMismatch,
        }
    }

    /// Apply the enforcement policy to an inbound command.
    pub fn authenticate(&self, command: &UpdateCommand) -> AuthOutcome {
        if !self.enforce {
            return AuthOutcome::Accepted;
        }

        let Some(tag) = command.signature.as_deref().filter(|t| !t.is_empty()) else {
            return AuthOutcome::RejectedMissingSignature;
        };

        self.verify_fields(
            command.version.as_deref().unwrap_or_default(),
            command.checksum.as_deref().unwrap_or_default(),
            command.url.as_deref().unwrap_or_default(),
            tag,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "fleet-signing-key";

    fn signed_command(auth: &CommandAuthenticator) -> UpdateCommand {
        let url = "https://github.com/acme/sensor/releases/download/v1.1.0/firmware.bin";
        let checksum = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        UpdateCommand {
            version: Some("1.1.0".into()),
            url: Some(url.into()),
            checksum: Some(checksum.into()),
            signature: Some(auth.sign("1.1.0", checksum, url)),
            force: false,
        }
    }

    #[test]
    fn test_canonical_message() {
        assert_eq!(canonical_message("1.2.0", "abc", "http://x/fw.bin"), "1.2.0|abc|http://x/fw.bin");
        assert_eq!(canonical_message("1.2.0", "", "u"), "1.2.0||u");
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let auth = CommandAuthenticator::new("Jefe", true);
        let mut mac = auth.mac().expect("HMAC accepts any key length");
        mac.update(b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac.finalize().into_bytes()),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_valid_tag_accepted() {
        let auth = CommandAuthenticator::new(KEY, true);
        let command = signed_command(&auth);
        assert_eq!(auth.authenticate(&command), AuthOutcome::Accepted);
    }

    #[test]
    fn test_uppercase_tag_accepted() {
        let auth = CommandAuthenticator::new(KEY, true);
        let mut command = signed_command(&auth);
        command.signature = command.signature.map(|s| s.to_uppercase());
        assert_eq!(auth.authenticate(&command), AuthOutcome::Accepted);
    }

    #[test]
    fn test_any_field_flip_is_mismatch() {
        let auth = CommandAuthenticator::new(KEY, true);

        let mut command = signed_command(&auth);
        command.version = Some("1.1.1".into());
        assert_eq!(auth.authenticate(&command), AuthOutcome::RejectedSignatureMismatch);

        let mut command = signed_command(&auth);
        command.checksum = command.checksum.map(|c| c.replacen('9', "8", 1));
        assert_eq!(auth.authenticate(&command), AuthOutcome::RejectedSignatureMismatch);

        let mut command = signed_command(&auth);
        command.url = command.url.map(|u| u.replace("acme", "acmf"));
        assert_eq!(auth.authenticate(&command), AuthOutcome::RejectedSignatureMismatch);
    }

    #[test]
    fn test_wrong_key_is_mismatch() {
        let signer = CommandAuthenticator::new("other-key", true);
        let auth = CommandAuthenticator::new(KEY, true);
        assert_eq!(
            auth.authenticate(&signed_command(&signer)),
            AuthOutcome::RejectedSignatureMismatch
        );
    }

    #[test]
    fn test_missing_and_garbage_tags() {
        let auth = CommandAuthenticator::new(KEY, true);

        let mut command = signed_command(&auth);
        command.signature = None;
        assert_eq!(auth.authenticate(&command), AuthOutcome::RejectedMissingSignature);

        command.signature = Some(String::new());
        assert_eq!(auth.authenticate(&command), AuthOutcome::RejectedMissingSignature);

        command.signature = Some("not-hex".into());
        assert_eq!(auth.authenticate(&command), AuthOutcome::RejectedSignatureMismatch);
    }

    #[test]
    fn test_disabled_accepts_unsigned() {
        let auth = CommandAuthenticator::disabled();
        let mut command = signed_command(&CommandAuthenticator::new(KEY, true));
        command.signature = None;
        assert_eq!(auth.authenticate(&command), AuthOutcome::Accepted);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let auth = CommandAuthenticator::new(KEY, true);
        assert!(!format!("{:?}", auth).contains(KEY));
    }
}
