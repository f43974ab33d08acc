//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outgoing requests are always signed with `rsa-sha256` over
//! `(request-target)`, `date` and `host` when present, and `digest`.
//! Verification is lenient about how peers label their key PEM and answers
//! with a plain boolean.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue, Method, Request};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Algorithm name written into every outgoing Signature header
pub const SIGNATURE_ALGORITHM: &str = "rsa-sha256";

/// RSA modulus size used when no explicit size is requested
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Freshly generated key material, both halves PEM encoded
#[derive(Debug, Clone)]
pub struct Keypair {
    /// PKCS#8 `PRIVATE KEY`
    pub private_key_pem: String,
    /// SubjectPublicKeyInfo `PUBLIC KEY`
    pub public_key_pem: String,
}

/// Generate a 2048-bit RSA keypair
pub fn generate_keypair() -> Result<Keypair, AppError> {
    generate_keypair_with_bits(DEFAULT_KEY_BITS)
}

/// Generate an RSA keypair of the given modulus size
pub fn generate_keypair_with_bits(bits: usize) -> Result<Keypair, AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Key(format!("Failed to generate RSA key: {}", e)))?;

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Key(format!("Failed to encode private key: {}", e)))?
        .to_string();
    let public_key_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Key(format!("Failed to encode public key: {}", e)))?;

    Ok(Keypair {
        private_key_pem,
        public_key_pem,
    })
}

/// Derive the public half of a private key
///
/// Deterministic: the same private key always yields the same PEM text.
pub fn derive_public_key(private_key_pem: &str) -> Result<String, AppError> {
    let private_key = parse_private_key(private_key_pem)?;
    RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Key(format!("Failed to encode public key: {}", e)))
}

/// Format a timestamp the way the `Date` header expects
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Sign an outgoing request in place
///
/// Adds a `Digest` header for the body and a `Signature` header covering
/// `(request-target)`, then `date` and `host` if the request carries them,
/// then `digest`. Any algorithm label a caller might expect is normalized to
/// `rsa-sha256`.
///
/// # Example
/// ```ignore
/// let mut request = http::Request::post("https://remote.example/inbox")
///     .header("date", http_date(Utc::now()))
///     .header("host", "remote.example")
///     .body(body)?;
/// sign_request(&private_key_pem, "https://local.example/users/alice#main-key", &mut request)?;
/// ```
pub fn sign_request(
    private_key_pem: &str,
    key_id: &str,
    request: &mut Request<Vec<u8>>,
) -> Result<(), AppError> {
    let private_key = parse_private_key(private_key_pem)?;

    let digest = generate_digest(request.body());
    request.headers_mut().insert(
        "digest",
        HeaderValue::from_str(&digest)
            .map_err(|e| AppError::Validation(format!("Invalid digest header: {}", e)))?,
    );

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut header_names = vec!["(request-target)"];
    let mut signing_parts = vec![format!(
        "(request-target): {} {}",
        request.method().as_str().to_lowercase(),
        path_and_query
    )];

    for name in ["date", "host", "digest"] {
        if let Some(value) = request.headers().get(name) {
            let value = value
                .to_str()
                .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))?;
            header_names.push(name);
            signing_parts.push(format!("{}: {}", name, value));
        }
    }

    let signing_string = signing_parts.join("\n");

    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNATURE_ALGORITHM,
        header_names.join(" "),
        signature_b64
    );

    request.headers_mut().insert(
        "signature",
        HeaderValue::from_str(&signature_header)
            .map_err(|e| AppError::Validation(format!("Invalid signature header: {}", e)))?,
    );

    Ok(())
}

/// Verify a request signature against a public key
///
/// Never panics; any malformed input yields `false`.
pub fn verify_request<B: AsRef<[u8]>>(public_key_pem: &str, request: &Request<B>) -> bool {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    verify_parts(
        public_key_pem,
        request.method(),
        path_and_query,
        request.headers(),
        request.body().as_ref(),
    )
}

/// Verify a signature given the pieces of a received request
///
/// `path_and_query` is the request target exactly as received.
pub fn verify_parts(
    public_key_pem: &str,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> bool {
    match check_signature(public_key_pem, method, path_and_query, headers, body) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Signature verification failed");
            false
        }
    }
}

fn check_signature(
    public_key_pem: &str,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let signature_header = header_str(headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;

    if !parsed.algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM)
        && !parsed.algorithm.eq_ignore_ascii_case("hs2019")
    {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    if parsed.headers.iter().any(|h| h == "digest") {
        verify_digest(header_str(headers, "digest")?, body)?;
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.as_str().to_lowercase(), path_and_query),
            "(created)" => parsed
                .created
                .clone()
                .ok_or_else(|| AppError::Validation("Missing created parameter".to_string()))?,
            "(expires)" => parsed
                .expires
                .clone()
                .ok_or_else(|| AppError::Validation("Missing expires parameter".to_string()))?,
            pseudo if pseudo.starts_with('(') => {
                return Err(AppError::Validation(format!(
                    "Unsupported pseudo-header in signature: {}",
                    pseudo
                )));
            }
            header => {
                let values = headers
                    .get_all(header)
                    .iter()
                    .map(|v| v.to_str())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| AppError::Validation(format!("Invalid {} header", header)))?;
                if values.is_empty() {
                    return Err(AppError::Validation(format!("Missing {} header", header)));
                }
                values.join(", ")
            }
        };
        signing_parts.push(format!("{}: {}", name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(parsed.signature.as_bytes())
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Validation(format!("Invalid signature format: {}", e)))?;

    let public_key = parse_public_key(public_key_pem)?;
    VerifyingKey::<Sha256>::new(public_key)
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

fn verify_digest(digest_header: &str, body: &[u8]) -> Result<(), AppError> {
    let expected = BASE64.encode(Sha256::digest(body));

    // Several algorithms may be listed; only SHA-256 is checked.
    let sha256 = digest_header.split(',').find_map(|part| {
        let (algorithm, value) = part.trim().split_once('=')?;
        algorithm
            .trim()
            .eq_ignore_ascii_case("sha-256")
            .then(|| value.trim())
    });

    match sha256 {
        Some(value) if value == expected => Ok(()),
        Some(_) => Err(AppError::Validation("Digest mismatch".to_string())),
        None => Err(AppError::Validation(
            "Digest header lacks a SHA-256 value".to_string(),
        )),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
}

/// Extract keyId from the Signature header, if present and well formed.
pub fn extract_key_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("signature")?.to_str().ok()?;
    parse_signature_header(value).ok().map(|parsed| parsed.key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Declared algorithm
    pub algorithm: String,
    /// Signed header names, lowercased, in signing order
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
    pub created: Option<String>,
    pub expires: Option<String>,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// Quoted values may contain commas and `=`. A missing `headers`
/// parameter means `date` alone was signed.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;
    let mut created = None;
    let mut expires = None;

    for (key, value) in signature_params(header)? {
        match key {
            "keyId" => key_id = Some(value),
            "algorithm" => algorithm = Some(value),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                )
            }
            "signature" => signature = Some(value),
            "created" => created = Some(value),
            "expires" => expires = Some(value),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Validation("Missing algorithm".to_string()))?,
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
        created,
        expires,
    })
}

fn signature_params(header: &str) -> Result<Vec<(&str, String)>, AppError> {
    let mut params = Vec::new();
    let mut rest = header.trim();

    while !rest.is_empty() {
        let (key, after_key) = rest
            .split_once('=')
            .ok_or_else(|| AppError::Validation("Malformed Signature header".to_string()))?;
        let key = key.trim();
        let after_key = after_key.trim_start();

        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            let end = quoted
                .find('"')
                .ok_or_else(|| AppError::Validation("Unterminated quoted value".to_string()))?;
            (quoted[..end].to_string(), &quoted[end + 1..])
        } else {
            let end = after_key.find(',').unwrap_or(after_key.len());
            (after_key[..end].trim().to_string(), &after_key[end..])
        };

        params.push((key, value));
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    Ok(params)
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, AppError> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
        return Ok(key);
    }

    // The PEM label does not always match the encoding inside.
    let der = pem_body(pem).ok_or_else(|| AppError::Key("Invalid private key PEM".to_string()))?;
    RsaPrivateKey::from_pkcs8_der(&der)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der))
        .map_err(|e| AppError::Key(format!("Invalid private key: {}", e)))
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, AppError> {
    if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
        return Ok(key);
    }
    if let Ok(key) = RsaPublicKey::from_pkcs1_pem(pem) {
        return Ok(key);
    }

    let der = pem_body(pem).ok_or_else(|| AppError::Key("Invalid public key PEM".to_string()))?;
    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| AppError::Key(format!("Invalid public key: {}", e)))
}

fn pem_body(pem: &str) -> Option<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return None;
    }
    BASE64.decode(body.as_bytes()).ok()
}
