//! Azure Blob Storage over its REST API, authorized by a shared access signature.
//!
//! The connection string is parsed and the container created on first use;
//! both are memoized once they succeed.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tokio::sync::OnceCell;
use tracing::info;
use url::Url;

use crate::{
    application::ports::{DurableStore, StoreError},
    infra::error::InfraError,
};

const API_VERSION: &str = "2021-08-06";

#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerTarget {
    /// Container URL without the signature, e.g. `https://acct.blob.core.windows.net/fortunes`.
    container: Url,
    sas: String,
}

impl ContainerTarget {
    fn container_url(&self) -> Url {
        let mut url = self.container.clone();
        url.set_query(Some(&format!("restype=container&{}", self.sas)));
        url
    }

    fn blob_url(&self, key: &str) -> Result<Url, StoreError> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut url = self.container.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::configuration("blob endpoint cannot hold a path"))?
            .pop_if_empty()
            .extend(key.split('/'));
        url.set_query(Some(&self.sas));
        Ok(url)
    }
}

pub struct AzureBlobStore {
    client: Client,
    connection_string: Option<String>,
    container: String,
    target: OnceCell<ContainerTarget>,
}

impl AzureBlobStore {
    pub fn new(connection_string: Option<String>, container: String) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("fortunecat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build http client: {err}"))
            })?;

        Ok(Self {
            client,
            connection_string,
            container,
            target: OnceCell::new(),
        })
    }

    async fn target(&self) -> Result<&ContainerTarget, StoreError> {
        self.target.get_or_try_init(|| self.prepare()).await
    }

    async fn prepare(&self) -> Result<ContainerTarget, StoreError> {
        let connection_string = self
            .connection_string
            .as_deref()
            .ok_or_else(|| StoreError::configuration("store.connection_string is not set"))?;
        let target = parse_connection_string(connection_string, &self.container)?;

        let response = self
            .request(Method::PUT, target.container_url())
            .send()
            .await
            .map_err(StoreError::transport)?;
        match response.status() {
            StatusCode::CREATED => {
                info!(
                    target = "fortunecat::store",
                    container = %self.container,
                    "Created blob container"
                );
            }
            StatusCode::CONFLICT => {}
            _ => return Err(status_error(response).await),
        }

        Ok(target)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("x-ms-version", API_VERSION)
    }
}

#[async_trait]
impl DurableStore for AzureBlobStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let url = self.target().await?.blob_url(key)?;
        let response = self
            .request(Method::HEAD, url)
            .send()
            .await
            .map_err(StoreError::transport)?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(response).await),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let url = self.target().await?.blob_url(key)?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(StoreError::transport)?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.bytes().await.map_err(StoreError::transport)?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_error(response).await),
        }
    }

    async fn put(&self, key: &str, blob: Bytes, overwrite: bool) -> Result<(), StoreError> {
        let url = self.target().await?.blob_url(key)?;
        let mut request = self
            .request(Method::PUT, url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("content-type", "application/octet-stream")
            .body(blob);
        if !overwrite {
            request = request.header("if-none-match", "*");
        }

        let response = request.send().await.map_err(StoreError::transport)?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED if !overwrite => {
                Err(StoreError::AlreadyExists(key.to_string()))
            }
            _ => Err(status_error(response).await),
        }
    }
}

async fn status_error(response: Response) -> StoreError {
    let status = response.status().as_u16();
    let detail = response.text().await.unwrap_or_default();
    StoreError::Status { status, detail }
}

/// Accepts `BlobEndpoint=...;SharedAccessSignature=...`, or an account name and
/// endpoint suffix in place of `BlobEndpoint`. Account keys are not supported.
fn parse_connection_string(value: &str, container: &str) -> Result<ContainerTarget, StoreError> {
    let mut blob_endpoint = None;
    let mut sas = None;
    let mut account_name = None;
    let mut protocol = None;
    let mut suffix = None;
    let mut has_account_key = false;

    for part in value.split(';').map(str::trim).filter(|part| !part.is_empty()) {
        let (key, val) = part.split_once('=').ok_or_else(|| {
            StoreError::configuration(format!("malformed connection string segment `{part}`"))
        })?;
        match key.to_ascii_lowercase().as_str() {
            "blobendpoint" => blob_endpoint = Some(val.trim().to_string()),
            "sharedaccesssignature" => sas = Some(val.trim().trim_start_matches('?').to_string()),
            "accountname" => account_name = Some(val.trim().to_string()),
            "defaultendpointsprotocol" => protocol = Some(val.trim().to_string()),
            "endpointsuffix" => suffix = Some(val.trim().to_string()),
            "accountkey" => has_account_key = true,
            _ => {}
        }
    }

    let sas = sas.filter(|sas| !sas.is_empty()).ok_or_else(|| {
        if has_account_key {
            StoreError::configuration("account key authentication is not supported; use a SAS")
        } else {
            StoreError::configuration("connection string has no SharedAccessSignature")
        }
    })?;

    let endpoint = match (blob_endpoint, account_name) {
        (Some(endpoint), _) => endpoint,
        (None, Some(account)) => format!(
            "{}://{account}.blob.{}",
            protocol.as_deref().unwrap_or("https"),
            suffix.as_deref().unwrap_or("core.windows.net")
        ),
        (None, None) => {
            return Err(StoreError::configuration(
                "connection string has neither BlobEndpoint nor AccountName",
            ));
        }
    };

    let mut url = Url::parse(&endpoint)
        .map_err(|err| StoreError::configuration(format!("invalid blob endpoint: {err}")))?;
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| StoreError::configuration("blob endpoint cannot hold a path"))?
        .pop_if_empty()
        .push(container);

    Ok(ContainerTarget {
        container: url,
        sas,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAS_CONNECTION: &str = "BlobEndpoint=https://fortunecat.blob.core.windows.net/;\
        SharedAccessSignature=sv=2022-11-02&ss=b&srt=co&sp=rwc&sig=abc%3D";

    #[test]
    fn parses_sas_connection_string() {
        let target = parse_connection_string(SAS_CONNECTION, "fortunes").expect("target");
        assert_eq!(
            target.container.as_str(),
            "https://fortunecat.blob.core.windows.net/fortunes"
        );
        assert_eq!(target.sas, "sv=2022-11-02&ss=b&srt=co&sp=rwc&sig=abc%3D");
        assert_eq!(
            target.container_url().as_str(),
            "https://fortunecat.blob.core.windows.net/fortunes?restype=container&sv=2022-11-02&ss=b&srt=co&sp=rwc&sig=abc%3D"
        );
    }

    #[test]
    fn blob_url_keeps_nested_keys() {
        let target = parse_connection_string(SAS_CONNECTION, "fortunes").expect("target");
        let url = target.blob_url("examples/42.txt").expect("url");
        assert_eq!(
            url.as_str(),
            "https://fortunecat.blob.core.windows.net/fortunes/examples/42.txt?sv=2022-11-02&ss=b&srt=co&sp=rwc&sig=abc%3D"
        );
        assert!(target.blob_url("").is_err());
    }

    #[test]
    fn derives_endpoint_from_account_name() {
        let target = parse_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=cats;EndpointSuffix=core.windows.net;\
             SharedAccessSignature=?sig=x",
            "screens",
        )
        .expect("target");
        assert_eq!(
            target.container.as_str(),
            "https://cats.blob.core.windows.net/screens"
        );
        assert_eq!(target.sas, "sig=x");
    }

    #[test]
    fn rejects_account_key_only_connection_strings() {
        let err = parse_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=cats;AccountKey=c2VjcmV0",
            "screens",
        )
        .expect_err("account keys are unsupported");
        assert!(matches!(err, StoreError::Configuration(message) if message.contains("SAS")));
    }

    #[tokio::test]
    async fn missing_connection_string_fails_on_first_use() {
        let store = AzureBlobStore::new(None, "fortunes".to_string()).expect("client");
        let err = store.exists("screen.json").await.expect_err("not configured");
        assert!(matches!(err, StoreError::Configuration(_)));
    }
}
