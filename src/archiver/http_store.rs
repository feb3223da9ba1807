//! REST-based object store against an Azure-Blob-Storage-compatible
//! endpoint. Collision-is-error semantics are realized with the `If-None-Match: *`
//! conditional header Azure Blob honors for a create-only PUT.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::object_store::{ObjectStore, PutOptions};
use crate::error::{PipelineError, Result};

pub struct HttpBlobStore {
    client: Client,
    base_url: String,
    container: String,
    sas_token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>, container: impl Into<String>, sas_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            container: container.into(),
            sas_token,
        }
    }

    fn blob_url(&self, path: &str) -> String {
        let mut url = format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.container,
            path
        );
        if let Some(sas) = &self.sas_token {
            url.push('?');
            url.push_str(sas.trim_start_matches('?'));
        }
        url
    }

    fn classify_status(status: StatusCode, body: &str) -> PipelineError {
        let code = status.as_u16();
        let lower = body.to_ascii_lowercase();
        let transient = matches!(code, 408 | 429 | 500 | 502 | 503 | 504)
            || ["timeout", "throttl", "connection", "temporary", "retry", "service unavailable"]
                .iter()
                .any(|needle| lower.contains(needle));
        if transient {
            PipelineError::TransientStorage { attempts: 1, message: format!("HTTP {code}: {body}") }
        } else {
            PipelineError::permanent_storage(format!("HTTP {code}: {body}"))
        }
    }
}

#[async_trait]
impl ObjectStore for HttpBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, opts: PutOptions) -> Result<()> {
        let mut req = self
            .client
            .put(self.blob_url(path))
            .header("Content-Type", opts.content_type)
            .header("x-ms-blob-type", "BlockBlob");
        if opts.fail_if_exists {
            req = req.header("If-None-Match", "*");
        }
        for (k, v) in &opts.metadata {
            req = req.header(format!("x-ms-meta-{k}"), v.clone());
        }
        let resp = req.body(bytes).send().await?;
        if resp.status() == StatusCode::PRECONDITION_FAILED || resp.status() == StatusCode::CONFLICT {
            return Err(PipelineError::permanent_storage(format!("object already exists at {path}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(self.blob_url(path)).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/{}?restype=container&comp=list&prefix={}",
            self.base_url.trim_end_matches('/'),
            self.container,
            prefix
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        let body = resp.text().await?;
        Ok(parse_blob_names_from_list_xml(&body))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let resp = self.client.head(self.blob_url(path)).send().await?;
        Ok(resp.status().is_success())
    }
}

/// Minimal extraction of `<Name>...</Name>` entries from Azure's
/// `ListBlobs` XML response, enough for prefix enumeration without pulling
/// in a full XML parser for one call site.
fn parse_blob_names_from_list_xml(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Name>") {
        let after = &rest[start + "<Name>".len()..];
        let Some(end) = after.find("</Name>") else { break };
        out.push(after[..end].to_string());
        rest = &after[end + "</Name>".len()..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_names_from_list_xml() {
        let xml = "<EnumerationResults><Blobs><Blob><Name>a.bin</Name></Blob><Blob><Name>b.bin</Name></Blob></Blobs></EnumerationResults>";
        assert_eq!(parse_blob_names_from_list_xml(xml), vec!["a.bin", "b.bin"]);
    }

    #[test]
    fn classifies_throttling_as_transient() {
        let err = HttpBlobStore::classify_status(StatusCode::TOO_MANY_REQUESTS, "throttled");
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_not_found_as_permanent() {
        let err = HttpBlobStore::classify_status(StatusCode::NOT_FOUND, "missing");
        assert!(!err.is_retryable());
    }
}
