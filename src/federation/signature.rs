//! HTTP request signing
//!
//! Authenticates inter-node requests by signing a canonical string derived
//! from method, path, host, date and body digest. Signatures are RSA-PSS
//! over SHA-256, transported in a `Signature` header of the form
//! `keyId="...",algorithm="hs2019",headers="(request-target) host date[ digest]",signature="..."`.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pss::{Signature as PssSignature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

use super::keys::{import_private_key, import_public_key};

/// Maximum clock skew accepted on the Date header, in seconds.
const MAX_DATE_SKEW_SECONDS: i64 = 300;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Extract and validate the remote actor host from an actor URL or key ID.
///
/// Rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_host(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Validation(format!(
            "Actor host not allowed: {}",
            host
        )));
    }

    Ok(host)
}

/// Resolve a host through DNS and reject it when any address lands in
/// loopback, private or otherwise non-routable space. Catches hosts that
/// look public but resolve internally.
pub async fn validate_resolved_host(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| {
            AppError::RemoteActorUnavailable(format!("{}: resolution failed: {}", host, e))
        })?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Validation(format!(
                "Actor host resolves to a disallowed address: {}",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::RemoteActorUnavailable(format!(
            "{}: resolved to no addresses",
            host
        )));
    }
    Ok(())
}

/// Build the canonical signing string.
///
/// Byte-for-byte reconstruction on both sides is mandatory: lowercased
/// method, newline-joined lines, no trailing newline, and a digest line
/// only when a body digest is supplied.
pub fn canonical_string(
    method: &str,
    path_and_query: &str,
    host: &str,
    date: &str,
    digest: Option<&str>,
) -> String {
    let mut parts = vec![
        format!("(request-target): {} {}", method.to_lowercase(), path_and_query),
        format!("host: {}", host),
        format!("date: {}", date),
    ];

    if let Some(digest) = digest {
        parts.push(format!("digest: {}", digest));
    }

    parts.join("\n")
}

/// Sign a canonical string with RSA-PSS (SHA-256, salt length = digest length).
pub fn sign(canonical: &str, private_key: &RsaPrivateKey) -> Result<Vec<u8>, AppError> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, canonical.as_bytes());
    Ok(signature.to_bytes().to_vec())
}

/// Verify a signature over a canonical string.
///
/// Deterministic: a cryptographically bad signature is `false`, never an error.
pub fn verify(canonical: &str, public_key: &RsaPublicKey, signature: &[u8]) -> bool {
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    let Ok(signature) = PssSignature::try_from(signature) else {
        return false;
    };

    verifying_key
        .verify(canonical.as_bytes(), &signature)
        .is_ok()
}

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an outgoing HTTP request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path = parsed_url.path();
    let path_and_query = if let Some(query) = parsed_url.query() {
        format!("{}?{}", path, query)
    } else {
        path.to_string()
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let canonical = canonical_string(method, &path_and_query, host, &date, digest.as_deref());

    let private_key = import_private_key(private_key_pem)?;
    let signature_b64 = BASE64.encode(sign(&canonical, &private_key)?);

    let mut headers_list = vec!["(request-target)", "host", "date"];
    if digest.is_some() {
        headers_list.push("digest");
    }

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"hs2019\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm, when advertised
    pub algorithm: Option<String>,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse a Signature header value
///
/// Missing required fields are `SignatureMalformed`, distinct from a
/// missing header (`SignatureMissing`) and a cryptographically failed
/// verification (`SignatureInvalid`).
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id
            .ok_or_else(|| AppError::SignatureMalformed("Missing keyId".to_string()))?,
        algorithm,
        headers: headers.unwrap_or_else(|| {
            vec![
                "(request-target)".to_string(),
                "host".to_string(),
                "date".to_string(),
            ]
        }),
        signature: signature
            .ok_or_else(|| AppError::SignatureMalformed("Missing signature".to_string()))?,
    })
}

/// Extract keyId from the Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let signature_header = headers
        .get("signature")
        .ok_or(AppError::SignatureMissing)?
        .to_str()
        .map_err(|_| AppError::SignatureMalformed("Non-ASCII Signature header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;
    Ok(parsed.key_id)
}

/// Validate that the signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

fn required_header<'a>(
    headers: &'a http::HeaderMap,
    name: &str,
) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::SignatureMalformed(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::SignatureMalformed(format!("Invalid {} header", name)))
}

/// Verify an incoming HTTP request signature
///
/// Reconstructs the canonical string from the signed-headers list and the
/// request, checks the Digest for bodies, then verifies the RSA-PSS
/// signature against the supplied public key.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let signature_header = headers
        .get("signature")
        .ok_or(AppError::SignatureMissing)?
        .to_str()
        .map_err(|_| AppError::SignatureMalformed("Non-ASCII Signature header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;

    if let Some(ref algorithm) = parsed.algorithm {
        if algorithm != "hs2019" {
            return Err(AppError::SignatureMalformed(format!(
                "Unsupported signature algorithm: {}",
                algorithm
            )));
        }
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::SignatureMalformed(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::SignatureMalformed(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // Reject stale or future-dated requests.
    let date_str = required_header(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::SignatureMalformed("Invalid Date format".to_string()))?;

    let skew = (Utc::now().timestamp() - date.timestamp()).abs();
    if skew > MAX_DATE_SKEW_SECONDS {
        return Err(AppError::SignatureMalformed(
            "Date header too old or in future".to_string(),
        ));
    }

    // The body must match the signed digest exactly.
    if let Some(body_data) = body {
        let digest_str = required_header(headers, "digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(AppError::SignatureInvalid);
        }
    }

    let mut signing_parts = Vec::new();
    for header_name in &parsed.headers {
        let line = match header_name.as_str() {
            "(request-target)" => {
                format!("(request-target): {} {}", method.to_lowercase(), path)
            }
            "host" | "date" | "digest" => {
                format!("{}: {}", header_name, required_header(headers, header_name)?)
            }
            _ => {
                return Err(AppError::SignatureMalformed(format!(
                    "Unsupported header in signature: {}",
                    header_name
                )));
            }
        };
        signing_parts.push(line);
    }
    let canonical = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::SignatureMalformed("Invalid signature encoding".to_string()))?;

    let public_key = import_public_key(public_key_pem)?;

    if !verify(&canonical, &public_key, &signature_bytes) {
        return Err(AppError::SignatureInvalid);
    }

    Ok(())
}

/// Generate SHA-256 digest for a request body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

/// Fetch a remote actor document
///
/// Any fetch or parse failure is `RemoteActorUnavailable`; the caller
/// rejects the inbound activity and never retries within the request.
pub async fn fetch_remote_actor(
    actor_url: &str,
    http_client: &reqwest::Client,
) -> Result<serde_json::Value, AppError> {
    let host = extract_actor_host(actor_url)?;
    let parsed = url::Url::parse(actor_url.split('#').next().unwrap_or(actor_url))
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation("Missing port in actor URL".to_string()))?;
    validate_resolved_host(&host, port).await?;

    let response = http_client
        .get(actor_url)
        .header("Accept", "application/activity+json")
        .send()
        .await
        .map_err(|e| AppError::RemoteActorUnavailable(format!("{}: {}", actor_url, e)))?;

    if !response.status().is_success() {
        return Err(AppError::RemoteActorUnavailable(format!(
            "{}: HTTP {}",
            actor_url,
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::RemoteActorUnavailable(format!("{}: {}", actor_url, e)))
}

/// Fetch a remote actor's public key by key ID
///
/// # Arguments
/// * `key_id` - Full URL to the key (e.g., actor#main-key)
///
/// # Returns
/// PEM-encoded public key
pub async fn fetch_public_key(
    key_id: &str,
    http_client: &reqwest::Client,
) -> Result<String, AppError> {
    let actor_url = key_id.split('#').next().unwrap_or(key_id);
    let actor = fetch_remote_actor(actor_url, http_client).await?;

    let public_key = actor.get("publicKey").ok_or_else(|| {
        AppError::RemoteActorUnavailable(format!("{}: missing publicKey", actor_url))
    })?;

    // If a key fragment is provided, ensure the actor advertises exactly that key id.
    if key_id.contains('#') {
        let advertised_key_id = public_key
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                AppError::RemoteActorUnavailable(format!("{}: missing publicKey.id", actor_url))
            })?;

        if advertised_key_id != key_id {
            return Err(AppError::Validation(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }
    }

    public_key
        .get("publicKeyPem")
        .and_then(|pem| pem.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::RemoteActorUnavailable(format!("{}: missing publicKeyPem", actor_url))
        })
}
