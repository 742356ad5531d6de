use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use hearth::pairing::{AuthenticateResponse, CryptoKind, PairingMode};
use hearth::role::UserInfo;

use rand::Rng;

use tokio::time::sleep;

use tokio_util::sync::CancellationToken;

use tracing::{error, info};

use uuid::Uuid;

use crate::auth::{hmac_sha256, AuthManager, RevocationStore};
use crate::error::{Error, ErrorKind, Result};
use crate::provider::Clock;
use crate::{b64_decode, b64_encode};

use super::{ExchangerRole, KeyExchanger, PlainExchanger, SpakeExchanger};

const SESSION_EXPIRATION: StdDuration = StdDuration::from_secs(5 * 60);
const PAIRING_EXPIRATION: StdDuration = StdDuration::from_secs(5 * 60);
const MAX_PAIRING_ATTEMPTS: u32 = 3;
const PAIRING_BLOCK_TIME_SECS: i64 = 60;

/// Listener invoked when a pairing session opens, with the session id, the
/// mode and the pairing code to present to the user.
pub type PairingStartListener = Box<dyn Fn(&str, PairingMode, &str) + Send + Sync>;

/// Listener invoked when a pending pairing session closes.
pub type PairingEndListener = Box<dyn Fn(&str) + Send + Sync>;

struct Session {
    exchanger: Box<dyn KeyExchanger>,
    expiry: CancellationToken,
}

#[derive(Default)]
struct Sessions {
    pending: HashMap<String, Session>,
    confirmed: HashMap<String, Session>,
    attempts: u32,
    block_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Listeners {
    on_start: Vec<PairingStartListener>,
    on_end: Vec<PairingEndListener>,
}

#[derive(Default)]
struct Shared {
    sessions: Mutex<Sessions>,
    listeners: Mutex<Listeners>,
}

fn notify_end(shared: &Shared, session_id: &str) {
    for listener in shared.listeners.lock().unwrap().on_end.iter() {
        listener(session_id);
    }
}

fn close_pending(shared: &Shared, session_id: &str) -> bool {
    let session = shared.sessions.lock().unwrap().pending.remove(session_id);
    match session {
        Some(session) => {
            session.expiry.cancel();
            notify_end(shared, session_id);
            true
        }
        None => false,
    }
}

fn close_confirmed(shared: &Shared, session_id: &str) -> bool {
    let session = shared.sessions.lock().unwrap().confirmed.remove(session_id);
    match session {
        Some(session) => {
            session.expiry.cancel();
            true
        }
        None => false,
    }
}

#[derive(Clone, Copy)]
enum ExpiryKind {
    Pending,
    Confirmed,
}

// Expiry tasks hold a weak back-reference: firing after the manager is
// gone, or after the session closed, is a no-op.
fn spawn_expiry(
    shared: Weak<Shared>,
    session_id: String,
    token: CancellationToken,
    delay: StdDuration,
    kind: ExpiryKind,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            () = sleep(delay) => {
                if let Some(shared) = shared.upgrade() {
                    match kind {
                        ExpiryKind::Pending => {
                            close_pending(&shared, &session_id);
                        }
                        ExpiryKind::Confirmed => {
                            close_confirmed(&shared, &session_id);
                        }
                    }
                }
            }
        }
    });
}

fn unknown_session(session_id: &str) -> Error {
    Error::new(
        ErrorKind::UnknownSession,
        format!("Unknown session id: '{session_id}'"),
    )
}

/// Orchestrates pairing sessions and authenticates local requests.
///
/// A session moves from pending (opened by `start_pairing`) to confirmed
/// (key agreement completed by `confirm_pairing`); a confirmed session
/// proves possession of the shared key through `is_valid_pairing_code`,
/// which unlocks access-token issuance. Brute forcing of pairing codes is
/// throttled: after too many attempts the device reports itself busy
/// for a while.
pub struct SecurityManager {
    auth: Arc<AuthManager>,
    revocation: Arc<RevocationStore>,
    clock: Arc<dyn Clock>,
    pairing_modes: Vec<PairingMode>,
    embedded_code: Option<String>,
    security_disabled: bool,
    shared: Arc<Shared>,
}

impl SecurityManager {
    /// Creates a [`SecurityManager`].
    ///
    /// `security_disabled` admits the no-crypto exchanger and lifts the
    /// brute-force throttle; it exists for development builds only.
    ///
    /// # Errors
    ///
    /// Fails with `invalidParams` unless an embedded code is configured
    /// exactly when the embedded-code mode is enabled.
    pub fn new(
        auth: Arc<AuthManager>,
        revocation: Arc<RevocationStore>,
        pairing_modes: Vec<PairingMode>,
        embedded_code: Option<String>,
        security_disabled: bool,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let embedded_enabled = pairing_modes.contains(&PairingMode::EmbeddedCode);
        let has_code = embedded_code
            .as_deref()
            .is_some_and(|code| !code.is_empty());
        if embedded_enabled != has_code {
            return Err(Error::new(
                ErrorKind::InvalidParams,
                "An embedded code must be configured exactly when the embedded-code mode is enabled",
            ));
        }

        Ok(Self {
            auth,
            revocation,
            clock,
            pairing_modes,
            embedded_code,
            security_disabled,
            shared: Arc::new(Shared::default()),
        })
    }

    /// Returns the enabled pairing modes.
    #[must_use]
    pub fn pairing_modes(&self) -> &[PairingMode] {
        &self.pairing_modes
    }

    /// Returns the supported crypto kinds.
    #[must_use]
    pub fn crypto_kinds(&self) -> Vec<CryptoKind> {
        let mut kinds = vec![CryptoKind::P224Spake];
        if self.security_disabled {
            kinds.push(CryptoKind::None);
        }
        kinds
    }

    /// Registers listeners for session starts and pending-session ends.
    pub fn register_pairing_listeners(
        &self,
        on_start: PairingStartListener,
        on_end: PairingEndListener,
    ) {
        let mut listeners = self.shared.listeners.lock().unwrap();
        listeners.on_start.push(on_start);
        listeners.on_end.push(on_end);
    }

    /// Opens a pairing session.
    ///
    /// Returns the session id and the base64-encoded device commitment.
    /// Any previously pending session is closed first: the device runs a
    /// single pairing at a time.
    ///
    /// # Errors
    ///
    /// Fails with `deviceBusy` while pairing is throttled and with
    /// `invalidParams` on a disabled mode or unsupported crypto.
    pub fn start_pairing(
        &self,
        mode: PairingMode,
        crypto: CryptoKind,
    ) -> Result<(String, String)> {
        self.check_pairing_allowed()?;

        if !self.pairing_modes.contains(&mode) {
            return Err(Error::new(
                ErrorKind::InvalidParams,
                "Pairing mode is not enabled",
            ));
        }
        let code = match mode {
            PairingMode::EmbeddedCode => self
                .embedded_code
                .clone()
                .ok_or_else(|| Error::new(ErrorKind::InvalidParams, "Pairing mode is not enabled"))?,
            PairingMode::PinCode => format!("{:04}", rand::thread_rng().gen_range(0..10_000)),
        };

        let exchanger: Box<dyn KeyExchanger> = match crypto {
            CryptoKind::P224Spake => Box::new(SpakeExchanger::new(&code, ExchangerRole::Device)),
            CryptoKind::None if self.security_disabled => {
                Box::new(PlainExchanger::new(code.clone()))
            }
            CryptoKind::None => {
                return Err(Error::new(ErrorKind::InvalidParams, "Unsupported crypto"));
            }
        };

        // A single session at a time for now.
        let stale: Vec<String> = {
            let sessions = self.shared.sessions.lock().unwrap();
            sessions.pending.keys().cloned().collect()
        };
        for session_id in stale {
            close_pending(&self.shared, &session_id);
        }

        let commitment = exchanger.message();
        let token = CancellationToken::new();
        let session_id = {
            let mut sessions = self.shared.sessions.lock().unwrap();
            let session_id = loop {
                let candidate = Uuid::new_v4().to_string();
                if !sessions.pending.contains_key(&candidate)
                    && !sessions.confirmed.contains_key(&candidate)
                {
                    break candidate;
                }
            };
            sessions.pending.insert(
                session_id.clone(),
                Session {
                    exchanger,
                    expiry: token.clone(),
                },
            );
            session_id
        };
        spawn_expiry(
            Arc::downgrade(&self.shared),
            session_id.clone(),
            token,
            PAIRING_EXPIRATION,
            ExpiryKind::Pending,
        );

        info!("Pairing code for session {session_id} is {code}");
        for listener in self.shared.listeners.lock().unwrap().on_start.iter() {
            listener(&session_id, mode, &code);
        }

        Ok((session_id, b64_encode(&commitment)))
    }

    /// Completes the key agreement of a pending session.
    ///
    /// Returns the base64-encoded certificate fingerprint and the session
    /// signature `HMAC-SHA256(session key, fingerprint)`. The session moves
    /// from pending to confirmed and stays usable for authentication until
    /// it expires.
    ///
    /// # Errors
    ///
    /// Fails with `unknownSession` when no pending session carries the id,
    /// with `invalidFormat` on an undecodable commitment, and with
    /// `commitmentMismatch` when the commitment cannot be processed. All
    /// failures close the session.
    pub fn confirm_pairing(
        &self,
        session_id: &str,
        client_commitment: &str,
    ) -> Result<(String, String)> {
        let mut session = {
            let mut sessions = self.shared.sessions.lock().unwrap();
            sessions
                .pending
                .remove(session_id)
                .ok_or_else(|| unknown_session(session_id))?
        };
        session.expiry.cancel();

        let Some(commitment) = b64_decode(client_commitment) else {
            notify_end(&self.shared, session_id);
            return Err(Error::new(
                ErrorKind::InvalidFormat,
                format!("Invalid commitment string: '{client_commitment}'"),
            ));
        };

        if let Err(e) = session.exchanger.process(&commitment) {
            notify_end(&self.shared, session_id);
            return Err(Error::with_source(
                ErrorKind::CommitmentMismatch,
                "Pairing code or crypto implementation mismatch",
                e,
            ));
        }

        let key = session.exchanger.key()?;
        let fingerprint = self.auth.certificate_fingerprint();
        let signature = hmac_sha256(&key, fingerprint);

        let token = CancellationToken::new();
        session.expiry = token.clone();
        self.shared
            .sessions
            .lock()
            .unwrap()
            .confirmed
            .insert(session_id.to_owned(), session);
        spawn_expiry(
            Arc::downgrade(&self.shared),
            session_id.to_owned(),
            token,
            SESSION_EXPIRATION,
            ExpiryKind::Confirmed,
        );
        notify_end(&self.shared, session_id);

        Ok((b64_encode(fingerprint), b64_encode(&signature)))
    }

    /// Closes the pending or confirmed session with the given id.
    ///
    /// Cancelling a still-pending session refunds its pairing attempt.
    ///
    /// # Errors
    ///
    /// Fails with `unknownSession` when neither session exists.
    pub fn cancel_pairing(&self, session_id: &str) -> Result<()> {
        let confirmed = close_confirmed(&self.shared, session_id);
        let pending = close_pending(&self.shared, session_id);
        if pending {
            let mut sessions = self.shared.sessions.lock().unwrap();
            sessions.attempts = sessions.attempts.saturating_sub(1);
        }
        if confirmed || pending {
            Ok(())
        } else {
            Err(unknown_session(session_id))
        }
    }

    /// Returns whether `auth_code` proves possession of the key of any
    /// confirmed session.
    ///
    /// A valid code resets the brute-force throttle.
    #[must_use]
    pub fn is_valid_pairing_code(&self, auth_code: &str) -> bool {
        if self.security_disabled {
            return true;
        }
        let Some(decoded) = b64_decode(auth_code) else {
            return false;
        };

        let mut sessions = self.shared.sessions.lock().unwrap();
        let matched = sessions.confirmed.iter().any(|(id, session)| {
            session
                .exchanger
                .key()
                .map(|key| decoded == hmac_sha256(&key, id.as_bytes()))
                .unwrap_or(false)
        });
        if matched {
            sessions.attempts = 0;
            sessions.block_until = None;
            return true;
        }
        error!("Attempt to authenticate with an invalid code");
        false
    }

    /// Exchanges a valid pairing auth code for an access token asserting
    /// `user`.
    ///
    /// # Errors
    ///
    /// Fails with `invalid_auth_code` when the code matches no confirmed
    /// session.
    pub fn authenticate(
        &self,
        pairing_auth_code: &str,
        user: &UserInfo,
    ) -> Result<AuthenticateResponse> {
        if !self.is_valid_pairing_code(pairing_auth_code) {
            return Err(Error::new(
                ErrorKind::InvalidAuthCode,
                "Invalid pairing auth code",
            ));
        }
        Ok(AuthenticateResponse {
            access_token: self.create_access_token(user, self.clock.now()),
            expires_in: self.auth.access_token_ttl().num_seconds().unsigned_abs(),
            scope: user.role,
        })
    }

    /// Creates a base64-encoded access token asserting `user`.
    #[must_use]
    pub fn create_access_token(&self, user: &UserInfo, time: DateTime<Utc>) -> String {
        b64_encode(&self.auth.create_access_token(user, time))
    }

    /// Validates a base64-encoded access token against its signature, its
    /// lifetime and the revocation blacklist.
    ///
    /// # Errors
    ///
    /// Fails with `invalid_auth_code` on malformed, forged or expired
    /// tokens and with `access_denied` on revoked credentials.
    pub fn validate_access_token(&self, token: &str) -> Result<UserInfo> {
        let decoded = b64_decode(token)
            .ok_or_else(|| Error::new(ErrorKind::InvalidAuthCode, "Malformed access token"))?;
        let (user, issued) = self.auth.validate_access_token(&decoded)?;
        if self
            .revocation
            .is_blocked(&user.user_id.to_le_bytes(), &[], issued)
        {
            return Err(Error::new(
                ErrorKind::AccessDenied,
                "Credential has been revoked",
            ));
        }
        Ok(user)
    }

    fn check_pairing_allowed(&self) -> Result<()> {
        if self.security_disabled {
            return Ok(());
        }
        let now = self.clock.now();
        let mut sessions = self.shared.sessions.lock().unwrap();
        if sessions.block_until.is_some_and(|until| until > now) {
            return Err(Error::new(
                ErrorKind::DeviceBusy,
                "Too many pairing attempts",
            ));
        }
        sessions.attempts += 1;
        if sessions.attempts >= MAX_PAIRING_ATTEMPTS {
            info!("Pairing blocked for {PAIRING_BLOCK_TIME_SECS} seconds");
            sessions.block_until = Some(now + Duration::seconds(PAIRING_BLOCK_TIME_SECS));
        }
        Ok(())
    }
}
