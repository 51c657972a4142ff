//! S3-compatible object store over plain HTTP.
//!
//! Requests are signed with AWS Signature Version 4. Only the handful of
//! calls the uploader needs are implemented; response bodies are small XML
//! documents read with a minimal tag extractor.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;
use crate::core::{CompletedPart, ObjectHead, ObjectStore, Result, TransferError};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Connection settings for [`S3Client`]
#[derive(Debug, Clone)]
pub struct S3ClientConfig {
    /// Custom endpoint such as a MinIO server; AWS regional endpoint when absent
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Put the bucket in the path instead of the host name
    pub path_style: bool,
    pub timeout: Duration,
}

impl Default for S3ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: None,
            path_style: false,
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct S3Client {
    client: Client,
    endpoint: Url,
    config: S3ClientConfig,
}

impl S3Client {
    pub fn new(config: S3ClientConfig) -> Result<Self> {
        if config.access_key_id.is_empty() || config.secret_access_key.is_empty() {
            return Err(TransferError::Config("S3 credentials are not configured".to_string()));
        }

        let endpoint = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://s3.{}.amazonaws.com", config.region),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|err| TransferError::Config(format!("Invalid S3 endpoint '{}': {}", endpoint, err)))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client, endpoint, config })
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        let encoded_key = uri_encode(key, false);

        if self.config.path_style {
            let base = self.endpoint.path().trim_end_matches('/');
            url.set_path(&format!("{}/{}/{}", base, uri_encode(bucket, true), encoded_key));
        } else {
            let host = self
                .endpoint
                .host_str()
                .ok_or_else(|| TransferError::Config("S3 endpoint has no host".to_string()))?;
            url.set_host(Some(&format!("{}.{}", bucket, host)))
                .map_err(|err| TransferError::Config(format!("Invalid bucket host: {}", err)))?;
            url.set_path(&format!("/{}", encoded_key));
        }

        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: &[(&str, &str)],
        extra_headers: &BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<Response> {
        let mut url = self.object_url(bucket, key)?;
        let canonical_query = canonical_query(query);
        url.set_query(if canonical_query.is_empty() { None } else { Some(&canonical_query) });

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex::encode(Sha256::digest(&body));

        let mut headers = extra_headers.clone();
        headers.insert("host".to_string(), host_header(&url)?);
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(token) = &self.config.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let canonical = canonical_request(method.as_str(), url.path(), &canonical_query, &headers, &payload_hash);
        let authorization = self.authorization(now, &canonical, &headers);

        let mut request = self.client.request(method.clone(), url.clone()).header("authorization", authorization);
        for (name, value) in &headers {
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }

        debug!(%method, url = %url, "S3 request");
        let response = request.body(body).send().await.map_err(transport_error)?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }

    fn authorization(&self, now: DateTime<Utc>, canonical: &str, headers: &BTreeMap<String, String>) -> String {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = credential_scope(&date, &self.config.region);
        let to_sign = string_to_sign(&amz_date, &scope, canonical);
        let signature = signature(&self.config.secret_access_key, &date, &self.config.region, &to_sign);

        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.config.access_key_id,
            scope,
            signed_headers(headers),
            signature
        )
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        metadata: &HashMap<String, String>,
    ) -> Result<Option<String>> {
        let response = self.send(Method::PUT, bucket, key, &[], &metadata_headers(metadata), body).await?;
        Ok(etag_header(&response))
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let response = self
            .send(Method::POST, bucket, key, &[("uploads", "")], &metadata_headers(metadata), Bytes::new())
            .await?;
        let body = response.text().await?;

        xml_tag(&body, "UploadId")
            .map(xml_unescape)
            .ok_or_else(|| TransferError::internal("No UploadId in CreateMultipartUpload response"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        session_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let part = part_number.to_string();
        let query = [("partNumber", part.as_str()), ("uploadId", session_id)];
        let response = self.send(Method::PUT, bucket, key, &query, &BTreeMap::new(), body).await?;

        etag_header(&response).ok_or_else(|| TransferError::internal("No ETag in UploadPart response"))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<Option<String>> {
        let body = complete_body(parts);
        let headers = BTreeMap::from([("content-type".to_string(), "application/xml".to_string())]);
        let response = self
            .send(Method::POST, bucket, key, &[("uploadId", session_id)], &headers, Bytes::from(body))
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        // A 200 response can still carry an error document
        if text.contains("<Error>") {
            return Err(error_from_body(Some(status), &text));
        }

        Ok(xml_tag(&text, "ETag").map(xml_unescape))
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, session_id: &str) -> Result<()> {
        self.send(Method::DELETE, bucket, key, &[("uploadId", session_id)], &BTreeMap::new(), Bytes::new())
            .await?;
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let response = self.send(Method::HEAD, bucket, key, &[], &BTreeMap::new(), Bytes::new()).await?;

        Ok(ObjectHead {
            etag: etag_header(&response),
            size: response
                .headers()
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
        })
    }
}

fn metadata_headers(metadata: &HashMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(name, value)| (format!("x-amz-meta-{}", name.to_ascii_lowercase()), value.trim().to_string()))
        .collect()
}

fn etag_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| TransferError::Config("S3 endpoint has no host".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

async fn error_from_response(response: Response) -> TransferError {
    let status = response.status().as_u16();
    match response.text().await {
        Ok(body) => error_from_body(Some(status), &body),
        Err(err) => TransferError::Http(err),
    }
}

/// Map an S3 error document to [`TransferError::Remote`], falling back to the status code
fn error_from_body(status: Option<u16>, body: &str) -> TransferError {
    let fallback = status.map(|s| s.to_string()).unwrap_or_else(|| "Unknown".to_string());
    let code = xml_tag(body, "Code").map(xml_unescape).unwrap_or(fallback);
    let message = xml_tag(body, "Message")
        .map(xml_unescape)
        .unwrap_or_else(|| format!("HTTP status {}", status.unwrap_or_default()));

    TransferError::remote(status, code, message)
}

/// Connection and timeout failures never reached the server
fn transport_error(err: reqwest::Error) -> TransferError {
    if err.is_connect() || err.is_timeout() {
        TransferError::Network(err.to_string())
    } else {
        TransferError::Http(err)
    }
}

fn complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            xml_escape(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Text content of the first `<tag>` element
fn xml_tag<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim())
}

fn xml_unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Percent-encode per SigV4: unreserved characters pass, `/` passes unless `encode_slash`
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => encoded.push(byte as char),
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<_> = query
        .iter()
        .map(|(name, value)| (uri_encode(name, true), uri_encode(value, true)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn signed_headers(headers: &BTreeMap<String, String>) -> String {
    headers.keys().cloned().collect::<Vec<_>>().join(";")
}

/// Headers must already be keyed by lowercase name
fn canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
) -> String {
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        if path.is_empty() { "/" } else { path },
        query,
        canonical_headers,
        signed_headers(headers),
        payload_hash
    )
}

fn credential_scope(date: &str, region: &str) -> String {
    format!("{}/{}/{}/aws4_request", date, region, SERVICE)
}

fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    )
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn signature(secret: &str, date: &str, region: &str, string_to_sign: &str) -> String {
    let date_key = hmac(format!("AWS4{}", secret).as_bytes(), date);
    let region_key = hmac(&date_key, region);
    let service_key = hmac(&region_key, SERVICE);
    let signing_key = hmac(&service_key, "aws4_request");
    hex::encode(hmac(&signing_key, string_to_sign))
}
