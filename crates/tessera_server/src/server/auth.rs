#![forbid(unsafe_code)]

//! Session tokens minted by the external login flow.
//!
//! `v1.<base64url(claims json)>.<base64url(hmac-sha256 over the payload segment)>`

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tessera_domain::Profile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
	/// Provider-side user id.
	pub sub: String,
	pub login: String,
	pub display_name: String,
	#[serde(default)]
	pub profile_image_url: String,
	/// Terms accepted.
	#[serde(default)]
	pub policy: bool,
	pub exp: u64,
}

impl IdentityClaims {
	pub fn profile(&self) -> Profile {
		Profile {
			id: self.sub.clone(),
			login: self.login.clone(),
			display_name: self.display_name.clone(),
			profile_image_url: self.profile_image_url.clone(),
		}
	}
}

pub fn verify_session_token(token: &str, secret: &str, now: u64) -> anyhow::Result<IdentityClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: IdentityClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}
	if claims.sub.trim().is_empty() {
		return Err(anyhow!("token has no subject"));
	}

	Ok(claims)
}

#[cfg(test)]
pub(crate) fn sign_session_token(claims: &IdentityClaims, secret: &str) -> anyhow::Result<String> {
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).context("hmac key")?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn claims(exp: u64) -> IdentityClaims {
		IdentityClaims {
			sub: "1234".into(),
			login: "painter".into(),
			display_name: "Painter".into(),
			profile_image_url: String::new(),
			policy: true,
			exp,
		}
	}

	#[test]
	fn signed_token_verifies() {
		let token = sign_session_token(&claims(200), "secret").expect("sign");
		let got = verify_session_token(&token, "secret", 100).expect("verify");
		assert_eq!(got, claims(200));
		assert_eq!(got.profile().login, "painter");
	}

	#[test]
	fn wrong_secret_expired_or_garbled_tokens_fail() {
		let token = sign_session_token(&claims(200), "secret").expect("sign");
		assert!(verify_session_token(&token, "other", 100).is_err());
		assert!(verify_session_token(&token, "secret", 200).is_err());
		assert!(verify_session_token("v2.a.b", "secret", 100).is_err());
		assert!(verify_session_token("nonsense", "secret", 100).is_err());

		let tampered = token.replacen("v1.", "v1.e", 1);
		assert!(verify_session_token(&tampered, "secret", 100).is_err());
	}
}
