use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use hearth::role::{Role, UserInfo};

use crate::error::{Error, ErrorKind, Result};
use crate::provider::Clock;

use super::{hmac_sha256, hmac_sha256_verify};

const TOKEN_MAC_LEN: usize = 32;
// Scope byte, user id (LE u64), issue time (LE i64).
const TOKEN_TAIL_LEN: usize = 1 + 8 + 8;

const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 3600;

fn forged(message: &'static str) -> Error {
    Error::new(ErrorKind::InvalidAuthCode, message)
}

/// Issues and validates the access tokens that authenticate local requests.
///
/// A token is `HMAC-SHA256(auth_secret, tail) || tail` where the tail packs
/// the granted role, the user id and the issue time. Tokens round-trip
/// bit-exactly; anything that does not verify is rejected.
pub struct AuthManager {
    auth_secret: [u8; 32],
    certificate_fingerprint: [u8; 32],
    access_token_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl AuthManager {
    /// Creates an [`AuthManager`] from the device's long-term auth secret
    /// and the fingerprint of its TLS certificate.
    #[must_use]
    pub fn new(
        auth_secret: [u8; 32],
        certificate_fingerprint: [u8; 32],
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            auth_secret,
            certificate_fingerprint,
            access_token_ttl: Duration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECS),
            clock,
        }
    }

    /// Replaces the access-token lifetime.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    /// Returns the fingerprint of the device's TLS certificate.
    #[must_use]
    pub const fn certificate_fingerprint(&self) -> &[u8; 32] {
        &self.certificate_fingerprint
    }

    /// Returns the access-token lifetime.
    #[must_use]
    pub const fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    /// Creates an access token asserting `user`, issued at `time`.
    #[must_use]
    pub fn create_access_token(&self, user: &UserInfo, time: DateTime<Utc>) -> Vec<u8> {
        let mut tail = Vec::with_capacity(TOKEN_TAIL_LEN);
        tail.push(user.role.wire_byte());
        tail.extend_from_slice(&user.user_id.to_le_bytes());
        tail.extend_from_slice(&time.timestamp().to_le_bytes());

        let mac = hmac_sha256(&self.auth_secret, &tail);
        let mut token = Vec::with_capacity(TOKEN_MAC_LEN + TOKEN_TAIL_LEN);
        token.extend_from_slice(&mac);
        token.extend_from_slice(&tail);
        token
    }

    /// Parses an access token back into the identity it asserts and its
    /// issue time.
    ///
    /// # Errors
    ///
    /// Fails with `invalid_auth_code` on truncated, malformed or forged
    /// tokens.
    pub fn parse_access_token(&self, token: &[u8]) -> Result<(UserInfo, DateTime<Utc>)> {
        if token.len() != TOKEN_MAC_LEN + TOKEN_TAIL_LEN {
            return Err(forged("Malformed access token"));
        }
        let (mac, tail) = token.split_at(TOKEN_MAC_LEN);
        if !hmac_sha256_verify(&self.auth_secret, tail, mac) {
            return Err(forged("Access token signature mismatch"));
        }

        let role = Role::from_wire_byte(tail[0]).ok_or_else(|| forged("Unknown token scope"))?;
        let mut user_id = [0_u8; 8];
        user_id.copy_from_slice(&tail[1..9]);
        let mut timestamp = [0_u8; 8];
        timestamp.copy_from_slice(&tail[9..17]);
        let time = Utc
            .timestamp_opt(i64::from_le_bytes(timestamp), 0)
            .single()
            .ok_or_else(|| forged("Token issue time out of range"))?;

        Ok((UserInfo::new(role, u64::from_le_bytes(user_id)), time))
    }

    /// Parses an access token and additionally rejects tokens older than
    /// the configured lifetime.
    ///
    /// # Errors
    ///
    /// Same failures as [`AuthManager::parse_access_token`], plus
    /// `invalid_auth_code` on an expired token.
    pub fn validate_access_token(&self, token: &[u8]) -> Result<(UserInfo, DateTime<Utc>)> {
        let (user, issued) = self.parse_access_token(token)?;
        if self.clock.now().signed_duration_since(issued) > self.access_token_ttl {
            return Err(forged("Access token expired"));
        }
        Ok((user, issued))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use hearth::role::{Role, UserInfo};

    use crate::error::ErrorKind;
    use crate::tests::{test_auth_manager, FixedClock};

    use super::AuthManager;

    #[test]
    fn token_round_trip() {
        let (auth, _) = test_auth_manager();
        let time = Utc.timestamp_opt(1_412_121_212, 0).unwrap();

        for (role, user_id) in [
            (Role::None, 0),
            (Role::Viewer, 7),
            (Role::User, u64::MAX),
            (Role::Manager, 12_345_678_901),
            (Role::Owner, 1),
        ] {
            let user = UserInfo::new(role, user_id);
            let token = auth.create_access_token(&user, time);
            assert_eq!(auth.parse_access_token(&token).unwrap(), (user, time));
        }
    }

    #[test]
    fn token_bit_flips_are_rejected() {
        let (auth, _) = test_auth_manager();
        let time = Utc.timestamp_opt(1_412_121_212, 0).unwrap();
        let token = auth.create_access_token(&UserInfo::new(Role::User, 42), time);

        for byte in 0..token.len() {
            for bit in 0..8 {
                let mut mutated = token.clone();
                mutated[byte] ^= 1 << bit;
                assert!(
                    auth.parse_access_token(&mutated).is_err(),
                    "bit {bit} of byte {byte} accepted"
                );
            }
        }
    }

    #[test]
    fn truncated_token_is_rejected() {
        let (auth, _) = test_auth_manager();
        let token =
            auth.create_access_token(&UserInfo::new(Role::User, 42), Utc::now());
        assert_eq!(
            auth.parse_access_token(&token[..token.len() - 1])
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidAuthCode
        );
        assert_eq!(
            auth.parse_access_token(&[]).unwrap_err().kind(),
            ErrorKind::InvalidAuthCode
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let clock = Arc::new(FixedClock::at(1_412_121_212));
        let auth = AuthManager::new([7; 32], [9; 32], clock.clone())
            .with_token_ttl(Duration::seconds(60));

        let user = UserInfo::new(Role::User, 42);
        let token = auth.create_access_token(&user, clock.now_value());

        clock.advance(Duration::seconds(60));
        assert!(auth.validate_access_token(&token).is_ok());

        clock.advance(Duration::seconds(1));
        assert_eq!(
            auth.validate_access_token(&token).unwrap_err().kind(),
            ErrorKind::InvalidAuthCode
        );
    }

    #[test]
    fn different_secrets_do_not_cross_validate() {
        let clock = Arc::new(FixedClock::at(1_412_121_212));
        let first = AuthManager::new([1; 32], [0; 32], clock.clone());
        let second = AuthManager::new([2; 32], [0; 32], clock.clone());

        let token =
            first.create_access_token(&UserInfo::new(Role::Owner, 1), clock.now_value());
        assert!(first.parse_access_token(&token).is_ok());
        assert!(second.parse_access_token(&token).is_err());
    }
}
