//! Player auth tokens: HMAC-SHA256 signed, JWT-shaped

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_millis;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Claims carried by a player token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Player id the token was issued for
    pub sub: i32,
    /// Expiration time (Unix timestamp, seconds)
    pub exp: u64,
}

/// Verify a token and check it belongs to `player_id`
pub fn verify_token(token: &str, player_id: i32, secret: &str) -> Result<TokenClaims, AuthError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::InvalidToken);
    };

    let provided_signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    let mut mac = signer(secret)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&provided_signature)
        .map_err(|_| AuthError::InvalidToken)?;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    let claims: TokenClaims =
        serde_json::from_slice(&payload_json).map_err(|_| AuthError::InvalidToken)?;

    if claims.exp < unix_millis() / 1000 {
        return Err(AuthError::TokenExpired);
    }
    if claims.sub != player_id {
        return Err(AuthError::PlayerMismatch);
    }

    Ok(claims)
}

/// Sign a token for `player_id` valid for `ttl_secs`
pub fn issue_token(player_id: i32, ttl_secs: u64, secret: &str) -> Result<String, AuthError> {
    let claims = TokenClaims {
        sub: player_id,
        exp: unix_millis() / 1000 + ttl_secs,
    };
    let payload = serde_json::to_vec(&claims).map_err(|_| AuthError::InvalidToken)?;

    let header_b64 = URL_SAFE_NO_PAD.encode(TOKEN_HEADER);
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
    let mut mac = signer(secret)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{header_b64}.{payload_b64}.{signature_b64}"))
}

fn signer(secret: &str) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)
}

/// Authentication error types
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token was issued for another player")]
    PlayerMismatch,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn issued_token_verifies() {
        let token = issue_token(42, 60, SECRET).unwrap();
        let claims = verify_token(&token, 42, SECRET).unwrap();
        assert_eq!(claims.sub, 42);
    }

    #[test]
    fn wrong_player_or_secret_is_rejected() {
        let token = issue_token(42, 60, SECRET).unwrap();
        assert_eq!(verify_token(&token, 43, SECRET), Err(AuthError::PlayerMismatch));
        assert_eq!(verify_token(&token, 42, "other"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = issue_token(42, 60, SECRET).unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(br#"{"sub":1,"exp":99999999999}"#);
        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);
        assert_eq!(verify_token(&forged, 1, SECRET), Err(AuthError::InvalidToken));
    }

    #[test]
    fn malformed_and_expired_tokens_are_rejected() {
        assert_eq!(verify_token("not-a-token", 1, SECRET), Err(AuthError::InvalidToken));
        assert_eq!(verify_token("a.b.c.d", 1, SECRET), Err(AuthError::InvalidToken));

        let header_b64 = URL_SAFE_NO_PAD.encode(TOKEN_HEADER);
        let payload_b64 = URL_SAFE_NO_PAD.encode(br#"{"sub":1,"exp":1}"#);
        let mut mac = signer(SECRET).unwrap();
        mac.update(format!("{header_b64}.{payload_b64}").as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        let expired = format!("{header_b64}.{payload_b64}.{signature_b64}");
        assert_eq!(verify_token(&expired, 1, SECRET), Err(AuthError::TokenExpired));
    }
}
