//! AWS plumbing: credentials, region resolution, and SigV4 signing
//!
//! Just enough of the AWS surface for the discovery client: static
//! credentials from the environment, region lookup (environment first,
//! then the EC2 instance identity document), and request signing for
//! the JSON protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const INSTANCE_IDENTITY_URL: &str =
    "http://169.254.169.254/latest/dynamic/instance-identity/document";

/// Static API credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    /// Read credentials from the standard environment variables.
    /// Missing credentials are a fatal configuration error.
    pub fn from_env() -> anyhow::Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID is not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY is not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

#[derive(Deserialize)]
struct InstanceIdentity {
    #[serde(default)]
    region: String,
}

/// Resolve the region from `AWS_REGION` / `AWS_DEFAULT_REGION`, falling
/// back to the EC2 instance identity document. Failure here is fatal at
/// startup; nothing else in the process can work without a region.
pub async fn resolve_region() -> anyhow::Result<String> {
    for var in ["AWS_REGION", "AWS_DEFAULT_REGION"] {
        if let Ok(region) = std::env::var(var) {
            if !region.is_empty() {
                return Ok(region);
            }
        }
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let body = http
        .get(INSTANCE_IDENTITY_URL)
        .send()
        .await
        .context("no region in environment and instance metadata is unreachable")?
        .error_for_status()
        .context("instance metadata request failed")?
        .bytes()
        .await?;
    let doc: InstanceIdentity =
        serde_json::from_slice(&body).context("malformed instance identity document")?;
    if doc.region.is_empty() {
        bail!("instance identity document has no region");
    }
    Ok(doc.region)
}

/// Produce the `Authorization` header value for a SigV4-signed request.
///
/// `headers` must be the lowercase-keyed headers that will be sent,
/// including `host` and `x-amz-date`; every one of them is signed.
/// `amz_date` is the `YYYYMMDD'T'HHMMSS'Z'` timestamp also present in
/// the headers.
#[allow(clippy::too_many_arguments)]
pub fn sign_request(
    credentials: &Credentials,
    region: &str,
    service: &str,
    method: &str,
    path: &str,
    headers: &BTreeMap<String, String>,
    payload: &[u8],
    amz_date: &str,
) -> String {
    let date = &amz_date[..8.min(amz_date.len())];
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
    let scope = format!("{}/{}/{}/aws4_request", date, region, service);

    let canonical = canonical_request(method, path, headers, payload);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(&canonical.into_bytes())
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        date.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key_id, scope, signed_headers, signature
    )
}

/// The canonical request string: method, URI, (empty) query string, the
/// sorted header block, the signed-header list, and the payload hash.
fn canonical_request(
    method: &str,
    path: &str,
    headers: &BTreeMap<String, String>,
    payload: &[u8],
) -> String {
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        path,
        "", // query string; every call here POSTs its parameters in the body
        canonical_headers,
        signed_headers,
        sha256_hex(payload)
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
