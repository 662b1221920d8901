//! Trust boundary: turns a signed bearer token into an authenticated caller
//!
//! Only the principal id (`sub`) and email are taken from the token. Role-like claims
//! are read and discarded; roles always come from the assignment table.

use crate::error::{AuthzError, Result};
use crate::types::{Principal, PrincipalId};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[allow(dead_code)]
    exp: i64,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    app_metadata: serde_json::Value,
}

/// Caller identity established by the trust boundary
///
/// There is no public constructor; the only way to obtain one is
/// [`TrustBoundary::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedCaller {
    principal_id: PrincipalId,
    email: String,
}

impl AuthenticatedCaller {
    pub fn principal_id(&self) -> &PrincipalId {
        &self.principal_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Principal for presentation-tier guards
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.principal_id.clone(),
            email: self.email.clone(),
            authenticated: true,
        }
    }
}

/// HS256 bearer token verifier
pub struct TrustBoundary {
    decoding: DecodingKey,
    validation: Validation,
}

impl TrustBoundary {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // BaaS tokens carry aud="authenticated"; audience is not part of the contract
        validation.validate_aud = false;

        Self {
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a raw token
    pub fn verify(&self, token: &str) -> Result<AuthenticatedCaller> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthzError::InvalidToken(e.to_string()))?;
        let claims = data.claims;

        if claims.sub.trim().is_empty() {
            return Err(AuthzError::InvalidToken("missing subject".to_string()));
        }

        if claims.role.as_deref().is_some_and(|r| r != "authenticated")
            || claims.app_metadata.get("role").is_some()
        {
            debug!("Ignoring role claim in token for {}", claims.sub);
        }

        Ok(AuthenticatedCaller {
            principal_id: PrincipalId::new(claims.sub),
            email: claims.email.unwrap_or_default(),
        })
    }

    /// Verify an `Authorization` header value of the form `Bearer <token>`
    pub fn verify_header(&self, header: &str) -> Result<AuthenticatedCaller> {
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| AuthzError::InvalidToken("expected bearer scheme".to_string()))?;
        self.verify(token.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"test-secret";

    fn token(claims: serde_json::Value, secret: &[u8]) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_verify_valid_token() {
        let boundary = TrustBoundary::new(SECRET);
        let t = token(json!({"sub": "u-1", "email": "u@example.com", "exp": exp()}), SECRET);

        let caller = boundary.verify(&t).unwrap();
        assert_eq!(caller.principal_id().as_str(), "u-1");
        assert_eq!(caller.email(), "u@example.com");
        assert!(caller.principal().authenticated);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let boundary = TrustBoundary::new(SECRET);
        let t = token(json!({"sub": "u-1", "exp": exp()}), b"other-secret");
        assert!(matches!(boundary.verify(&t), Err(AuthzError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let boundary = TrustBoundary::new(SECRET);
        let t = token(json!({"sub": "u-1", "exp": chrono::Utc::now().timestamp() - 3600}), SECRET);
        assert!(boundary.verify(&t).is_err());
    }

    #[test]
    fn test_empty_subject_rejected() {
        let boundary = TrustBoundary::new(SECRET);
        let t = token(json!({"sub": " ", "exp": exp()}), SECRET);
        assert!(boundary.verify(&t).is_err());
    }

    #[test]
    fn test_role_claims_do_not_leak_into_caller() {
        let boundary = TrustBoundary::new(SECRET);
        let t = token(
            json!({"sub": "u-1", "exp": exp(), "role": "admin", "app_metadata": {"role": "admin"}}),
            SECRET,
        );
        let caller = boundary.verify(&t).unwrap();
        assert_eq!(caller.principal_id().as_str(), "u-1");
    }

    #[test]
    fn test_header_parsing() {
        let boundary = TrustBoundary::new(SECRET);
        let t = token(json!({"sub": "u-1", "exp": exp()}), SECRET);

        assert!(boundary.verify_header(&format!("Bearer {}", t)).is_ok());
        assert!(boundary.verify_header(&t).is_err());
    }
}
