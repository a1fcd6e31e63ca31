//! Webhook authenticity checks.

use conveyor_core::repository::GitProvider;
use conveyor_core::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute an HMAC-SHA256 signature for a payload.
///
/// Returns the hex-encoded signature without any prefix.
pub fn compute_hmac_sha256(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a GitHub style `sha256=<hex>` signature header.
pub fn verify_github_signature(secret: &[u8], body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.trim().strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);

    // verify_slice compares in constant time
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Compare a GitLab token header against the configured secret in constant time.
pub fn verify_gitlab_token(secret: &str, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return false;
    };
    secret.as_bytes().ct_eq(token.as_bytes()).into()
}

/// Verify an inbound push for `provider`.
///
/// GitLab without a configured secret runs in open mode. GitHub always
/// requires a secret. A configured secret with no presented credential fails.
pub fn verify_push(
    provider: GitProvider,
    body: &[u8],
    signature: Option<&str>,
    secret: Option<&str>,
) -> Result<()> {
    match provider {
        GitProvider::Gitlab => {
            let Some(secret) = secret else {
                return Ok(());
            };
            match signature {
                None => Err(Error::Authentication("missing webhook token".to_string())),
                Some(_) if verify_gitlab_token(secret, signature) => Ok(()),
                Some(_) => Err(Error::Authentication("invalid webhook token".to_string())),
            }
        }
        GitProvider::Github => {
            let Some(secret) = secret else {
                return Err(Error::Authentication(
                    "webhook secret not configured".to_string(),
                ));
            };
            match signature {
                None => Err(Error::Authentication("missing webhook signature".to_string())),
                Some(_) if verify_github_signature(secret.as_bytes(), body, signature) => Ok(()),
                Some(_) => Err(Error::Authentication(
                    "invalid webhook signature".to_string(),
                )),
            }
        }
    }
}
