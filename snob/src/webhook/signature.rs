//! Gitea webhook signature verification.
//!
//! Gitea signs each delivery with HMAC-SHA256 of the raw request body under
//! the webhook's shared secret, hex-encoded in the `X-Gitea-Signature` header.

use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::pipeline::{Ctx, Middleware, Next, StageError};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Gitea-Signature";

/// Lowercase hex HMAC-SHA256 of `body` under `secret`.
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check `signature` against the body. Only the exact lowercase hex digest matches.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let expected = compute_signature(secret, body);
    let valid = constant_time_compare(&expected, signature);

    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = signature.len(),
            "gitea_signature_mismatch"
        );
    }

    valid
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check if signature verification is enabled.
pub fn is_signature_verification_enabled(secret: &Option<String>) -> bool {
    secret
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}

/// Stage rejecting requests whose body is not signed with the secret.
///
/// Empty body → `400`, missing header → `400`, mismatch → `401`. The body
/// stays buffered in the context, so the decode stage sees it unchanged.
pub struct CheckSignature {
    secret: String,
}

impl CheckSignature {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    async fn check(&self, ctx: &mut Ctx) -> Result<(), StageError> {
        let body = ctx.body_bytes().await?;
        if body.is_empty() {
            warn!("gitea_signature_empty_payload");
            return Err(StageError::EmptyBody);
        }

        let Some(signature) = ctx.header(SIGNATURE_HEADER) else {
            warn!("gitea_signature_missing_header");
            return Err(StageError::MissingSignature);
        };

        if !verify_signature(&self.secret, &body, signature) {
            return Err(StageError::InvalidSignature);
        }
        Ok(())
    }
}

impl Middleware for CheckSignature {
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self.check(ctx).await {
                Ok(()) => next.run(ctx).await,
                Err(err) => ctx.fail(err),
            }
        })
    }
}
