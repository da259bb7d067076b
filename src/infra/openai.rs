//! OpenAI-compatible text and image generation over HTTP.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    application::ports::{ChatMessage, ContentGenerator, GenerationError, PromptBundle},
    config::OpenAiSettings,
};

use super::error::InfraError;

const IMAGE_SIZE: &str = "1024x1024";
const IMAGE_QUALITY: &str = "standard";
const IMAGE_FORMAT: &str = "b64_json";

pub struct OpenAiGenerator {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    text_model: String,
    image_model: String,
}

impl OpenAiGenerator {
    pub fn new(settings: &OpenAiSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("fortunecat/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build http client: {err}"))
            })?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            text_model: settings.text_model.clone(),
            image_model: settings.image_model.clone(),
        })
    }

    fn api_key(&self) -> Result<&str, GenerationError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| GenerationError::configuration("openai.api_key is not set"))
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GenerationError> {
        let api_key = self.api_key()?;
        let url = endpoint(&self.base_url, path)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(GenerationError::transport)?;

        decode(response).await
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
    quality: &'a str,
    response_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    b64_json: Option<String>,
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate_text(&self, prompt: &PromptBundle) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.text_model,
            messages: &prompt.messages,
            max_tokens: prompt.max_tokens,
        };
        let response: ChatResponse = self.post("chat/completions", &request).await?;
        first_completion(response)
    }

    async fn generate_image(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = ImageRequest {
            model: &self.image_model,
            prompt,
            n: 1,
            size: IMAGE_SIZE,
            quality: IMAGE_QUALITY,
            response_format: IMAGE_FORMAT,
        };
        let response: ImageResponse = self.post("images/generations", &request).await?;
        image_reference(response)
    }
}

/// `path` appended to `base`, keeping any path prefix such as `/v1`.
fn endpoint(base: &Url, path: &str) -> Result<Url, GenerationError> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|err| {
        GenerationError::configuration(format!("invalid endpoint `{joined}`: {err}"))
    })
}

async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, GenerationError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(GenerationError::transport)?;
    if !status.is_success() {
        return Err(GenerationError::Status {
            status: status.as_u16(),
            detail: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| GenerationError::transport(format!("failed to parse body: {err}")))
}

fn first_completion(response: ChatResponse) -> Result<String, GenerationError> {
    response
        .choices
        .into_iter()
        .filter_map(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .find(|content| !content.is_empty())
        .ok_or_else(|| GenerationError::empty("chat completion had no content"))
}

fn image_reference(response: ImageResponse) -> Result<String, GenerationError> {
    let payload = response
        .data
        .into_iter()
        .find_map(|datum| datum.b64_json)
        .filter(|payload| !payload.is_empty())
        .ok_or_else(|| GenerationError::empty("image response had no payload"))?;

    STANDARD
        .decode(payload.as_bytes())
        .map_err(|err| GenerationError::empty(format!("image payload is not base64: {err}")))?;

    Ok(format!("data:image/png;base64,{payload}"))
}
