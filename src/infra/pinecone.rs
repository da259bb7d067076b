//! Pinecone-backed similarity index.
//!
//! The data-plane host is either configured or looked up once from the
//! environment's controller and memoized for the life of the process.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::OnceCell;
use tracing::info;
use url::Url;

use crate::{
    application::ports::{IndexError, SimilarityIndex},
    config::IndexSettings,
};

use super::error::InfraError;

const API_KEY_HEADER: &str = "Api-Key";

pub struct PineconeIndex {
    client: Client,
    api_key: Option<String>,
    environment: Option<String>,
    name: Option<String>,
    host: OnceCell<Url>,
}

impl PineconeIndex {
    pub fn new(settings: &IndexSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("fortunecat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build http client: {err}"))
            })?;

        let host = match settings.host.clone() {
            Some(url) => OnceCell::new_with(Some(url)),
            None => OnceCell::new(),
        };

        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            environment: settings.environment.clone(),
            name: settings.name.clone(),
            host,
        })
    }

    fn api_key(&self) -> Result<&str, IndexError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| IndexError::configuration("index.api_key is not set"))
    }

    async fn host(&self) -> Result<&Url, IndexError> {
        self.host.get_or_try_init(|| self.resolve_host()).await
    }

    async fn resolve_host(&self) -> Result<Url, IndexError> {
        let url = controller_url(self.environment.as_deref(), self.name.as_deref())?;
        let api_key = self.api_key()?;

        let request = self.client.get(url).header(API_KEY_HEADER, api_key);
        let description: IndexDescription = send(request).await?;
        let host = data_plane_url(&description.status.host)?;

        info!(
            target = "fortunecat::index",
            host = %host,
            "Resolved similarity index host"
        );
        Ok(host)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    id: &'a str,
    top_k: usize,
    namespace: &'a str,
    include_values: bool,
    include_metadata: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
}

#[derive(Debug, Deserialize)]
struct IndexDescription {
    status: IndexStatus,
}

#[derive(Debug, Deserialize)]
struct IndexStatus {
    host: String,
}

#[async_trait]
impl SimilarityIndex for PineconeIndex {
    async fn nearest(
        &self,
        id: &str,
        top_k: usize,
        namespace: &str,
    ) -> Result<Vec<String>, IndexError> {
        let api_key = self.api_key()?;
        let host = self.host().await?;
        let url = query_url(host)?;

        let body = QueryRequest {
            id,
            top_k,
            namespace,
            include_values: false,
            include_metadata: false,
        };
        let request = self
            .client
            .post(url)
            .header(API_KEY_HEADER, api_key)
            .json(&body);

        let response: QueryResponse = send(request).await?;
        Ok(response.matches.into_iter().map(|hit| hit.id).collect())
    }
}

/// Appends `/query` while keeping any path already on the host.
fn query_url(host: &Url) -> Result<Url, IndexError> {
    let joined = format!("{}/query", host.as_str().trim_end_matches('/'));
    Url::parse(&joined).map_err(|err| {
        IndexError::configuration(format!("invalid index host `{joined}`: {err}"))
    })
}

fn controller_url(environment: Option<&str>, name: Option<&str>) -> Result<Url, IndexError> {
    let environment = environment.ok_or_else(|| {
        IndexError::configuration("index.host or index.environment must be set")
    })?;
    let name = name.ok_or_else(|| IndexError::configuration("index.name is not set"))?;

    let candidate = format!("https://controller.{environment}.pinecone.io/databases/{name}");
    Url::parse(&candidate)
        .map_err(|err| IndexError::configuration(format!("invalid controller url: {err}")))
}

/// The controller reports a bare hostname; the data plane is always HTTPS.
fn data_plane_url(host: &str) -> Result<Url, IndexError> {
    let host = host.trim().trim_end_matches('/');
    if host.is_empty() {
        return Err(IndexError::configuration("controller reported an empty host"));
    }
    let candidate = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}/")
    } else {
        format!("https://{host}/")
    };
    Url::parse(&candidate)
        .map_err(|err| IndexError::configuration(format!("invalid index host `{host}`: {err}")))
}

async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, IndexError> {
    let response = request.send().await.map_err(IndexError::transport)?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(IndexError::transport)?;
    if !status.is_success() {
        return Err(IndexError::Status {
            status: status.as_u16(),
            detail: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| IndexError::transport(format!("failed to parse body: {err}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn settings() -> IndexSettings {
        IndexSettings {
            api_key: Some("key".to_string()),
            environment: None,
            name: Some("fortunes".to_string()),
            namespace: String::new(),
            host: None,
        }
    }

    #[test]
    fn query_url_keeps_the_host_path() {
        let bare = Url::parse("https://fortunes-abc.svc.pinecone.io").expect("url");
        assert_eq!(
            query_url(&bare).expect("query url").as_str(),
            "https://fortunes-abc.svc.pinecone.io/query"
        );

        let proxied = Url::parse("https://gateway.example/pinecone").expect("url");
        assert_eq!(
            query_url(&proxied).expect("query url").as_str(),
            "https://gateway.example/pinecone/query"
        );

        let slashed = Url::parse("https://gateway.example/pinecone/").expect("url");
        assert_eq!(
            query_url(&slashed).expect("query url").as_str(),
            "https://gateway.example/pinecone/query"
        );
    }

    #[test]
    fn query_body_uses_camel_case() {
        let body = QueryRequest {
            id: "42",
            top_k: 3,
            namespace: "fortunes",
            include_values: false,
            include_metadata: false,
        };
        assert_eq!(
            serde_json::to_value(&body).expect("json"),
            json!({
                "id": "42",
                "topK": 3,
                "namespace": "fortunes",
                "includeValues": false,
                "includeMetadata": false
            })
        );
    }

    #[test]
    fn query_response_keeps_match_order() {
        let response: QueryResponse = serde_json::from_value(json!({
            "matches": [
                {"id": "42", "score": 1.0},
                {"id": "7", "score": 0.93},
                {"id": "1999", "score": 0.91}
            ],
            "namespace": ""
        }))
        .expect("response");
        let ids: Vec<_> = response.matches.into_iter().map(|hit| hit.id).collect();
        assert_eq!(ids, vec!["42", "7", "1999"]);
    }

    #[test]
    fn controller_url_is_derived_from_environment_and_name() {
        let url = controller_url(Some("us-east1-gcp"), Some("fortunes")).expect("url");
        assert_eq!(
            url.as_str(),
            "https://controller.us-east1-gcp.pinecone.io/databases/fortunes"
        );
    }

    #[test]
    fn data_plane_url_adds_scheme() {
        let url = data_plane_url("fortunes-abc.svc.us-east1-gcp.pinecone.io").expect("url");
        assert_eq!(
            url.join("query").expect("join").as_str(),
            "https://fortunes-abc.svc.us-east1-gcp.pinecone.io/query"
        );
        assert!(data_plane_url("  ").is_err());
    }

    #[tokio::test]
    async fn missing_environment_fails_without_a_request() {
        let index = PineconeIndex::new(&settings()).expect("client");
        let err = index
            .nearest("42", 3, "")
            .await
            .expect_err("host cannot be resolved");
        assert!(matches!(err, IndexError::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_api_key_fails_on_first_use() {
        let mut settings = settings();
        settings.api_key = None;
        settings.host = Some(Url::parse("https://fortunes.example").expect("url"));

        let index = PineconeIndex::new(&settings).expect("client");
        let err = index.nearest("42", 3, "").await.expect_err("no key");
        assert!(matches!(err, IndexError::Configuration(_)));
    }
}
