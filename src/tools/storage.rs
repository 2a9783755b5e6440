//! Object storage for generated artifacts.
//!
//! Uploads go straight to the S3 REST API with AWS Signature Version 4
//! request signing, so any S3-compatible server works when an endpoint
//! override is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Request signing failed: {0}")]
    Signing(String),
}

/// A bucket that accepts public objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key` and return the object's public URL.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str)
        -> Result<String, StorageError>;
}

/// S3 (or S3-compatible) bucket.
pub struct S3Store {
    config: StorageConfig,
    client: reqwest::Client,
}

impl S3Store {
    pub fn new(config: StorageConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Public URL for `key`: virtual-hosted on AWS, path-style with an endpoint.
    pub fn object_url(&self, key: &str) -> String {
        let key = encode_key(key);
        match &self.config.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.config.bucket,
                key
            ),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.config.bucket, self.config.region, key
            ),
        }
    }

    fn sign(
        &self,
        url: &url::Url,
        payload_hash: &str,
        content_type: &str,
        now: DateTime<Utc>,
    ) -> Result<SignedHeaders, StorageError> {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(StorageError::Signing(format!("no host in {}", url))),
        };

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers: Vec<(&str, String)> = vec![
            ("content-type", content_type.to_string()),
            ("host", host),
            ("x-amz-content-sha256", payload_hash.to_string()),
            ("x-amz-date", amz_date.clone()),
        ];
        if let Some(token) = &self.config.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "PUT\n{}\n\n{}\n{}\n{}",
            url.path(),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = derive_signing_key(&self.config.secret_access_key, &date, &self.config.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(SignedHeaders {
            amz_date,
            authorization: format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                self.config.access_key_id, scope, signed_headers, signature
            ),
        })
    }
}

struct SignedHeaders {
    amz_date: String,
    authorization: String,
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let object_url = self.object_url(key);
        let url = url::Url::parse(&object_url)
            .map_err(|e| StorageError::Signing(format!("invalid object URL: {}", e)))?;

        let payload_hash = hex::encode(Sha256::digest(&body));
        let signed = self.sign(&url, &payload_hash, content_type, Utc::now())?;

        let mut request = self
            .client
            .put(url)
            .header("content-type", content_type)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(body);
        if let Some(token) = &self.config.session_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!("Uploaded {} to bucket {}", key, self.config.bucket);
        Ok(object_url)
    }
}

/// Percent-encode each path segment of an object key.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::Signing(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 signing key for one day, region and service.
pub fn derive_signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, StorageError> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}
