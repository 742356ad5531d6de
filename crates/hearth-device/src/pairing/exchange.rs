use std::sync::OnceLock;

use p224::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p224::elliptic_curve::{Field, PrimeField};
use p224::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};

use rand::rngs::OsRng;

use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind, Result};

/// Length of the shared key produced by a completed exchange.
pub const KEY_LEN: usize = 28;

// A P-224 point travels as its two affine coordinates.
const POINT_LEN: usize = 2 * KEY_LEN;

/// A single-round key-agreement strategy.
///
/// The device sends [`KeyExchanger::message`] to the peer, feeds the peer's
/// answer to [`KeyExchanger::process`] exactly once, and then reads the
/// shared key. The key is *unverified*: both sides prove knowledge of it
/// afterwards through an HMAC over known data.
pub trait KeyExchanger: Send {
    /// Returns the outgoing exchange message for the peer.
    fn message(&self) -> Vec<u8>;

    /// Processes the peer's exchange message.
    ///
    /// # Errors
    ///
    /// Fails with `commitmentMismatch` when the peer's message cannot be
    /// processed, and with `invalidState` when called a second time.
    fn process(&mut self, peer_message: &[u8]) -> Result<()>;

    /// Returns the shared unverified key.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` before a successful
    /// [`KeyExchanger::process`].
    fn key(&self) -> Result<Vec<u8>>;
}

/// Which side of the exchange an exchanger plays.
///
/// The two sides mask their commitments with different blinding points, so
/// an exchanger only interoperates with a peer of the opposite role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangerRole {
    /// The nearby client starting the pairing.
    Client,
    /// The device being paired.
    Device,
}

// Maps a seed to a curve point by hashing until the digest is the
// x-coordinate of one. Nobody knows a discrete log of the result.
fn derive_point(seed: &[u8]) -> ProjectivePoint {
    let mut counter: u32 = 0;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();

        let mut candidate = [0_u8; 1 + KEY_LEN];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&digest[..KEY_LEN]);
        if let Ok(encoded) = EncodedPoint::from_bytes(candidate) {
            if let Some(point) = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(
                &encoded,
            )) {
                return ProjectivePoint::from(point);
            }
        }
        counter += 1;
    }
}

fn blinding_points() -> &'static (ProjectivePoint, ProjectivePoint) {
    static POINTS: OnceLock<(ProjectivePoint, ProjectivePoint)> = OnceLock::new();
    POINTS.get_or_init(|| {
        (
            derive_point(b"hearth pairing client blind"),
            derive_point(b"hearth pairing device blind"),
        )
    })
}

fn random_scalar() -> Scalar {
    loop {
        let candidate = Scalar::random(&mut OsRng);
        if !bool::from(candidate.is_zero()) {
            return candidate;
        }
    }
}

// Reduces the shared code to a non-zero scalar.
fn password_scalar(code: &str) -> Scalar {
    let mut digest = Sha256::digest(code.as_bytes());
    loop {
        let repr = FieldBytes::clone_from_slice(&digest[..KEY_LEN]);
        if let Some(scalar) = Option::<Scalar>::from(Scalar::from_repr(repr)) {
            if !bool::from(scalar.is_zero()) {
                return scalar;
            }
        }
        digest = Sha256::digest(digest);
    }
}

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    let encoded = point.to_affine().to_encoded_point(false);
    let mut out = Vec::with_capacity(POINT_LEN);
    if let (Some(x), Some(y)) = (encoded.x(), encoded.y()) {
        out.extend_from_slice(x);
        out.extend_from_slice(y);
    }
    out
}

fn decode_point(bytes: &[u8]) -> Option<ProjectivePoint> {
    if bytes.len() != POINT_LEN {
        return None;
    }
    let x = FieldBytes::from_slice(&bytes[..KEY_LEN]);
    let y = FieldBytes::from_slice(&bytes[KEY_LEN..]);
    let encoded = EncodedPoint::from_affine_coordinates(x, y, false);
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
}

/// P-224 encrypted key exchange over a short shared code.
///
/// Each side commits to `G*x + B*pw` where `x` is an ephemeral secret,
/// `pw` the scalar derived from the code, and `B` the blinding point of its
/// role. Unmasking the peer's commitment and multiplying by the own secret
/// yields the same point on both sides; its x-coordinate is the shared key,
/// indistinguishable from random to anyone who did not know the code.
pub struct SpakeExchanger {
    role: ExchangerRole,
    password: Scalar,
    secret: Scalar,
    message: Vec<u8>,
    key: Option<[u8; KEY_LEN]>,
    processed: bool,
}

impl SpakeExchanger {
    /// Creates an exchanger for one side of the given pairing code.
    #[must_use]
    pub fn new(code: &str, role: ExchangerRole) -> Self {
        let password = password_scalar(code);
        let secret = random_scalar();
        let (client_blind, device_blind) = *blinding_points();
        let blind = match role {
            ExchangerRole::Client => client_blind,
            ExchangerRole::Device => device_blind,
        };
        let commitment = ProjectivePoint::GENERATOR * secret + blind * password;

        Self {
            role,
            password,
            secret,
            message: encode_point(&commitment),
            key: None,
            processed: false,
        }
    }
}

impl KeyExchanger for SpakeExchanger {
    fn message(&self) -> Vec<u8> {
        self.message.clone()
    }

    fn process(&mut self, peer_message: &[u8]) -> Result<()> {
        if self.processed {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "Key exchange already completed",
            ));
        }
        self.processed = true;

        let peer_point = decode_point(peer_message).ok_or_else(|| {
            Error::new(
                ErrorKind::CommitmentMismatch,
                "Peer commitment is not a curve point",
            )
        })?;
        let (client_blind, device_blind) = *blinding_points();
        let peer_blind = match self.role {
            ExchangerRole::Client => device_blind,
            ExchangerRole::Device => client_blind,
        };

        let shared = (peer_point - peer_blind * self.password) * self.secret;
        let encoded = shared.to_affine().to_encoded_point(false);
        let x = encoded.x().ok_or_else(|| {
            Error::new(ErrorKind::CommitmentMismatch, "Degenerate peer commitment")
        })?;

        let mut key = [0_u8; KEY_LEN];
        key.copy_from_slice(x);
        self.key = Some(key);
        Ok(())
    }

    fn key(&self) -> Result<Vec<u8>> {
        self.key
            .map(|key| key.to_vec())
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "Key exchange is not complete"))
    }
}

/// A no-crypto exchanger echoing the code as both message and key.
///
/// Only constructible through the security-disabled development path.
pub struct PlainExchanger {
    code: String,
    processed: bool,
}

impl PlainExchanger {
    /// Creates an exchanger echoing `code`.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            processed: false,
        }
    }
}

impl KeyExchanger for PlainExchanger {
    fn message(&self) -> Vec<u8> {
        self.code.clone().into_bytes()
    }

    fn process(&mut self, _peer_message: &[u8]) -> Result<()> {
        if self.processed {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "Key exchange already completed",
            ));
        }
        self.processed = true;
        Ok(())
    }

    fn key(&self) -> Result<Vec<u8>> {
        Ok(self.code.clone().into_bytes())
    }
}
