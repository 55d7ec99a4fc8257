// Request signature verification
// Decision: Tokens are HS256 JWTs issued by the queue service; the signing key string
//           itself is the HMAC secret
// Decision: Two keys (current, next) are tried in order so key rotation never rejects
//           a request signed just before or after the switch

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Issuer claim of every token the queue signs
pub const QSTASH_ISSUER: &str = "Upstash";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("no signing keys configured")]
    MissingKeys,

    #[error("request has no signature")]
    MissingSignature,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token subject '{actual}' does not match url '{expected}'")]
    SubjectMismatch { expected: String, actual: String },

    #[error("body hash does not match the signed hash")]
    BodyMismatch,
}

/// Regions that publish with their own signing keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Region {
    EuCentral1,
    UsEast1,
}

impl Region {
    pub const ALL: [Region; 2] = [Region::EuCentral1, Region::UsEast1];

    /// Normalized name, also the prefix of the region's key variables
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EuCentral1 => "EU_CENTRAL_1",
            Self::UsEast1 => "US_EAST_1",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = String;

    /// Accepts `eu-central-1`, `EU_CENTRAL_1` and anything in between
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|region| region.as_str() == normalized)
            .ok_or_else(|| format!("unknown region '{s}'"))
    }
}

/// A current/next signing key pair
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKeys {
    pub current: String,
    pub next: String,
}

impl SigningKeys {
    pub fn new(current: impl Into<String>, next: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            next: next.into(),
        }
    }
}

impl fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeys")
            .field("current", &"[REDACTED]")
            .field("next", &"[REDACTED]")
            .finish()
    }
}

/// Claims of a queue-signed token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureClaims {
    pub iss: String,

    /// Destination url the message was signed for
    pub sub: String,

    pub exp: i64,

    #[serde(default)]
    pub nbf: Option<i64>,

    #[serde(default)]
    pub iat: Option<i64>,

    #[serde(default)]
    pub jti: Option<String>,

    /// base64url SHA-256 of the request body
    pub body: String,
}

/// Inputs of one verification
#[derive(Debug, Clone)]
pub struct VerifyRequest<'a> {
    pub signature: &'a str,
    pub body: &'a [u8],
    /// When set, the token subject must equal it
    pub url: Option<&'a str>,
    /// Seconds of clock skew tolerated on `exp`/`nbf`
    pub clock_tolerance: u64,
    /// Region hint, usually the `Upstash-Region` header
    pub region: Option<&'a str>,
}

impl<'a> VerifyRequest<'a> {
    pub fn new(signature: &'a str, body: &'a [u8]) -> Self {
        Self {
            signature,
            body,
            url: None,
            clock_tolerance: 0,
            region: None,
        }
    }

    pub fn with_url(mut self, url: &'a str) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_clock_tolerance(mut self, seconds: u64) -> Self {
        self.clock_tolerance = seconds;
        self
    }

    pub fn with_region(mut self, region: Option<&'a str>) -> Self {
        self.region = region;
        self
    }
}

/// Verifies that requests were signed by the queue service
///
/// Keys are resolved per request: explicit keys first, then the keys of the region the
/// request came from, then the default keys.
#[derive(Debug, Clone, Default)]
pub struct Receiver {
    explicit: Option<SigningKeys>,
    regional: BTreeMap<Region, SigningKeys>,
    default: Option<SigningKeys>,
}

impl Receiver {
    /// A receiver that always uses these keys
    pub fn new(current: impl Into<String>, next: impl Into<String>) -> Self {
        Self::default().with_signing_keys(SigningKeys::new(current, next))
    }

    pub fn with_signing_keys(mut self, keys: SigningKeys) -> Self {
        self.explicit = Some(keys);
        self
    }

    pub fn with_region_keys(mut self, region: Region, keys: SigningKeys) -> Self {
        self.regional.insert(region, keys);
        self
    }

    pub fn with_default_keys(mut self, keys: SigningKeys) -> Self {
        self.default = Some(keys);
        self
    }

    /// Pick the key pair for a request from `region_hint`
    pub fn resolve_keys(&self, region_hint: Option<&str>) -> Result<&SigningKeys, SignatureError> {
        if let Some(keys) = &self.explicit {
            return Ok(keys);
        }

        if let Some(hint) = region_hint {
            match hint.parse::<Region>() {
                Ok(region) => {
                    if let Some(keys) = self.regional.get(&region) {
                        return Ok(keys);
                    }
                    debug!(%region, "no keys for region, using default keys");
                }
                Err(e) => warn!(error = %e, "ignoring region hint"),
            }
        }

        self.default.as_ref().ok_or(SignatureError::MissingKeys)
    }

    /// Verify a signature over `body`, returning the verified claims
    pub fn verify(&self, request: &VerifyRequest<'_>) -> Result<SignatureClaims, SignatureError> {
        if request.signature.is_empty() {
            return Err(SignatureError::MissingSignature);
        }

        let keys = self.resolve_keys(request.region)?;

        let current_error = match verify_with_key(&keys.current, request) {
            Ok(claims) => return Ok(claims),
            Err(e) => e,
        };
        debug!(error = %current_error, "current signing key rejected token, trying next");

        match verify_with_key(&keys.next, request) {
            Ok(claims) => Ok(claims),
            // The current key verified the token itself; its complaint is the real one
            Err(SignatureError::InvalidToken(_))
                if !matches!(current_error, SignatureError::InvalidToken(_)) =>
            {
                Err(current_error)
            }
            Err(next_error) => Err(next_error),
        }
    }
}

fn verify_with_key(
    key: &str,
    request: &VerifyRequest<'_>,
) -> Result<SignatureClaims, SignatureError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[QSTASH_ISSUER]);
    validation.leeway = request.clock_tolerance;
    validation.validate_nbf = true;
    validation.validate_aud = false;

    let token = decode::<SignatureClaims>(
        request.signature,
        &DecodingKey::from_secret(key.as_bytes()),
        &validation,
    )
    .map_err(|e| SignatureError::InvalidToken(e.to_string()))?;
    let claims = token.claims;

    if let Some(url) = request.url {
        if claims.sub != url {
            return Err(SignatureError::SubjectMismatch {
                expected: url.to_string(),
                actual: claims.sub,
            });
        }
    }

    if body_hash(request.body) != claims.body.trim_end_matches('=') {
        return Err(SignatureError::BodyMismatch);
    }

    Ok(claims)
}

/// base64url (unpadded) SHA-256 of a body
pub fn body_hash(body: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(body))
}
