//! Local credential machinery: HMAC-backed access tokens and the
//! persistent blacklist of revoked credentials.

mod revocation;
mod token;

pub use revocation::{RevocationEntry, RevocationStore, BLACK_LIST_KEY};
pub use token::AuthManager;

use hmac::{Hmac, Mac};

use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}
