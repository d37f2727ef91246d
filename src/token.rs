//! Opaque session token minting.
//!
//! Each session gets a token of the form `base64(claims).base64(hmac)` where
//! the claims carry the user id, an expiry and a random nonce. The engine only
//! hands the token out; clients echo it to adjacent services which verify it
//! with the shared secret.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::Duration;

type HmacSha1 = Hmac<Sha1>;

/// Mint a signed token for `user_id`, valid for `ttl`.
pub fn issue(secret: &[u8], user_id: &str, ttl: Duration) -> String {
    let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
    let nonce: u64 = rand::random();
    let claims = format!("{user_id}.{expiry}.{nonce:016x}");
    let sig = sign(secret, &claims);
    format!("{}.{}", BASE64.encode(&claims), sig)
}

/// Check signature and expiry. Returns the user id the token was minted for.
/// The engine itself never verifies; this is for services sitting next to it.
#[allow(dead_code)]
pub fn verify(secret: &[u8], token: &str) -> Option<String> {
    let (claims_b64, sig) = token.split_once('.')?;
    let claims_bytes = BASE64.decode(claims_b64).ok()?;
    let claims = String::from_utf8(claims_bytes).ok()?;
    if sign(secret, &claims) != sig {
        return None;
    }
    let mut parts = claims.rsplitn(3, '.');
    let _nonce = parts.next()?;
    let expiry: i64 = parts.next()?.parse().ok()?;
    let user_id = parts.next()?;
    if expiry <= Utc::now().timestamp() {
        return None;
    }
    Some(user_id.to_string())
}

fn sign(secret: &[u8], claims: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(claims.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}
