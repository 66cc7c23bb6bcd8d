use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::message::{ClientHello, Cookie};

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a cookie MAC key before it is rotated at next use.
pub const KEY_LIFETIME: Duration = Duration::from_secs(5 * 60);

const KEY_LEN: usize = 32;

struct MacKey {
    bytes: [u8; KEY_LEN],
    created: Instant,
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl MacKey {
    fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        MacKey {
            bytes,
            created: Instant::now(),
        }
    }
}

/// Produces and verifies stateless cookies (RFC 6347 §4.2.1).
///
/// `Cookie = HMAC-SHA256(key, peer ‖ client_version ‖ random ‖ session_id ‖
/// cipher_suites ‖ compression_methods)`. The key rotates lazily once it is
/// older than [`KEY_LIFETIME`]; the previous key is not retained, so a peer
/// whose cookie was minted under it simply repeats the verify exchange.
pub struct CookieFactory {
    key: Mutex<MacKey>,
}

impl CookieFactory {
    pub fn new() -> Self {
        CookieFactory {
            key: Mutex::new(MacKey::generate()),
        }
    }

    /// Compute the cookie expected from `peer` for this CLIENT_HELLO.
    ///
    /// The age check and rotation happen atomically under the key lock.
    pub fn expected_cookie(&self, peer: SocketAddr, hello: &ClientHello) -> Cookie {
        let mut key = self.key.lock();
        if key.created.elapsed() > KEY_LIFETIME {
            debug!("Rotating cookie MAC key");
            *key = MacKey::generate();
        }

        // Unwrap is ok, HMAC accepts any key length.
        let mut hmac = HmacSha256::new_from_slice(&key.bytes).unwrap();
        hmac.update(peer.to_string().as_bytes());
        hmac.update(&hello.client_version.to_u16().to_be_bytes());
        hmac.update(&hello.random);
        hmac.update(&hello.session_id);
        hmac.update(hello.cipher_suites);
        hmac.update(hello.compression_methods);
        let mac = hmac.finalize().into_bytes();

        // Unwrap is ok, a SHA-256 MAC always fits the 255 byte cookie cap.
        Cookie::try_new(&mac).unwrap()
    }

    /// Verify the cookie presented in a CLIENT_HELLO. Returns the expected
    /// cookie on mismatch so the caller can send HELLO_VERIFY_REQUEST.
    pub fn verify(&self, peer: SocketAddr, hello: &ClientHello) -> Result<(), Cookie> {
        let expected = self.expected_cookie(peer, hello);
        if expected.ct_eq(&hello.cookie).into() {
            Ok(())
        } else {
            Err(expected)
        }
    }
}

impl Default for CookieFactory {
    fn default() -> Self {
        Self::new()
    }
}
