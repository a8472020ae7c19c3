//! HTTP transport to the translation backend.
//!
//! All conversation endpoints speak JSON with camelCase keys. Failures
//! never panic: callers receive an [`ApiError`] describing validation
//! failures, connectivity problems, or rejected requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::model::{Conversation, ConversationId, Language, Message, MessageId, Role, User};

/// Client timeout for plain reads.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Message submission and summarization run a translation model on the
/// server before responding, so they get a much longer deadline.
const TRANSLATION_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    base_url: Url,
}

impl ApiConfig {
    pub fn new(backend_base_url: impl AsRef<str>) -> Result<Self, ApiError> {
        let mut base = backend_base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(ApiError::InvalidConfig(
                "backend base url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{}", base);
        }
        let mut parsed = Url::parse(&base)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid backend url: {err}")))?;
        // Keep any path prefix joinable: Url::join replaces the last
        // segment unless the base path ends with a slash.
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),
    #[error("message text cannot be empty")]
    EmptyMessage,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("backend rejected request ({status}): {detail}")]
    Http { status: StatusCode, detail: String },
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Whether the backend reported the conversation as missing. Callers
    /// use this to fall back to starting a fresh conversation instead of
    /// rendering a broken chat.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Conversation-scoped endpoints answer 404 when the id is unknown.
    fn scoped_to(self, conversation: &ConversationId) -> ApiError {
        match self {
            ApiError::Http { status, .. } if status == StatusCode::NOT_FOUND => {
                ApiError::NotFound(conversation.clone())
            }
            other => other,
        }
    }
}

/// One page of messages from the backend. `last_message_id` is the
/// cursor for the next incremental fetch; the backend sends null when
/// the batch is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatch {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
}

/// Full-text search hit across stored messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub original_text: String,
    pub translated_text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    #[serde(default)]
    pub results: Vec<SearchHit>,
    #[serde(default)]
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub summary: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    conversation_id: &'a ConversationId,
    role: Role,
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest<'a> {
    doctor_language: &'a str,
    patient_language: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryRequest<'a> {
    conversation_id: &'a ConversationId,
}

#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
    name: &'a str,
    role: Role,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct LanguageCatalog {
    #[serde(default)]
    languages: Vec<Language>,
}

#[derive(Debug, Deserialize)]
struct UserDirectory {
    #[serde(default)]
    users: Vec<User>,
}

/// Transport seam between the sync engine and the HTTP wire. The
/// production implementation is [`ReqwestChatBackend`]; tests substitute
/// scripted backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Fetch messages for a conversation. `after == None` asks for the
    /// full history; `Some(id)` asks only for messages newer than `id`.
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        after: Option<&MessageId>,
    ) -> Result<MessageBatch, ApiError>;

    /// Submit one utterance. The backend stores it together with its
    /// translation and echoes the persisted message back.
    async fn send_message(
        &self,
        conversation: &ConversationId,
        role: Role,
        text: &str,
    ) -> Result<Message, ApiError>;

    async fn fetch_conversation(&self, id: &ConversationId) -> Result<Conversation, ApiError>;

    async fn create_conversation(
        &self,
        doctor_language: &str,
        patient_language: &str,
    ) -> Result<Conversation, ApiError>;

    async fn list_languages(&self) -> Result<Vec<Language>, ApiError>;

    async fn search_messages(
        &self,
        query: &str,
        conversation: Option<&ConversationId>,
    ) -> Result<SearchResponse, ApiError>;

    async fn summarize(&self, conversation: &ConversationId)
    -> Result<ConversationSummary, ApiError>;

    async fn list_users(&self, role: Option<Role>) -> Result<Vec<User>, ApiError>;

    async fn create_user(&self, name: &str, role: Role, language: &str)
    -> Result<User, ApiError>;

    async fn health(&self) -> Result<HealthStatus, ApiError>;
}

pub struct ReqwestChatBackend {
    client: reqwest::Client,
    config: ApiConfig,
}

impl ReqwestChatBackend {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.config
            .base_url()
            .join(path)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let response = self.client.get(url).send().await?;
        decode(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, ApiError> {
        let mut request = self.client.post(url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        decode(response).await
    }
}

#[async_trait]
impl ChatBackend for ReqwestChatBackend {
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        after: Option<&MessageId>,
    ) -> Result<MessageBatch, ApiError> {
        let mut url = self.endpoint(&format!("messages/{conversation}"))?;
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", after.as_str());
        }
        self.get_json(url)
            .await
            .map_err(|err| err.scoped_to(conversation))
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        role: Role,
        text: &str,
    ) -> Result<Message, ApiError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ApiError::EmptyMessage);
        }
        let url = self.endpoint("message")?;
        let request = SendMessageRequest {
            conversation_id: conversation,
            role,
            text,
        };
        self.post_json(url, &request, Some(TRANSLATION_TIMEOUT))
            .await
            .map_err(|err| err.scoped_to(conversation))
    }

    async fn fetch_conversation(&self, id: &ConversationId) -> Result<Conversation, ApiError> {
        let url = self.endpoint(&format!("conversation/{id}"))?;
        self.get_json(url).await.map_err(|err| err.scoped_to(id))
    }

    async fn create_conversation(
        &self,
        doctor_language: &str,
        patient_language: &str,
    ) -> Result<Conversation, ApiError> {
        let url = self.endpoint("conversation")?;
        let request = CreateConversationRequest {
            doctor_language,
            patient_language,
        };
        self.post_json(url, &request, None).await
    }

    async fn list_languages(&self) -> Result<Vec<Language>, ApiError> {
        let url = self.endpoint("languages")?;
        let catalog: LanguageCatalog = self.get_json(url).await?;
        Ok(catalog.languages)
    }

    async fn search_messages(
        &self,
        query: &str,
        conversation: Option<&ConversationId>,
    ) -> Result<SearchResponse, ApiError> {
        let mut url = self.endpoint("search")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            if let Some(conversation) = conversation {
                pairs.append_pair("conversation_id", conversation.as_str());
            }
        }
        self.get_json(url).await
    }

    async fn summarize(
        &self,
        conversation: &ConversationId,
    ) -> Result<ConversationSummary, ApiError> {
        let url = self.endpoint("summary")?;
        let request = SummaryRequest { conversation_id: conversation };
        self.post_json(url, &request, Some(TRANSLATION_TIMEOUT))
            .await
            .map_err(|err| err.scoped_to(conversation))
    }

    async fn list_users(&self, role: Option<Role>) -> Result<Vec<User>, ApiError> {
        let mut url = self.endpoint("users")?;
        if let Some(role) = role {
            url.query_pairs_mut().append_pair("role", role.as_str());
        }
        let directory: UserDirectory = self.get_json(url).await?;
        Ok(directory.users)
    }

    async fn create_user(
        &self,
        name: &str,
        role: Role,
        language: &str,
    ) -> Result<User, ApiError> {
        let url = self.endpoint("users")?;
        let request = CreateUserRequest { name, role, language };
        self.post_json(url, &request, None).await
    }

    async fn health(&self) -> Result<HealthStatus, ApiError> {
        let url = self.endpoint("health")?;
        self.get_json(url).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let detail = match response.text().await {
            Ok(body) => extract_detail(&body).unwrap_or_else(|| format!("HTTP {status}")),
            Err(_) => format!("HTTP {status}"),
        };
        return Err(ApiError::Http { status, detail });
    }
    response
        .json::<T>()
        .await
        .map_err(|err| ApiError::InvalidResponse(err.to_string()))
}

/// Pull the human-readable `detail` field out of an error body, the
/// shape the backend uses for every rejection.
fn extract_detail(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<Value>,
    }
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match parsed.detail? {
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_prepends_http_scheme() {
        let config = ApiConfig::new("clinic.example.com:8000").unwrap();
        assert_eq!(config.base_url().as_str(), "http://clinic.example.com:8000/");
    }

    #[test]
    fn config_rejects_empty_url() {
        let err = ApiConfig::new("   ").unwrap_err();
        assert!(matches!(err, ApiError::InvalidConfig(_)));
    }

    #[test]
    fn config_preserves_path_prefix() {
        let config = ApiConfig::new("https://clinic.example.com/api").unwrap();
        let endpoint = config.base_url().join("messages/abc").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "https://clinic.example.com/api/messages/abc"
        );
    }

    #[test]
    fn not_found_mapping_is_scoped_to_conversation_endpoints() {
        let id = ConversationId::from("c9");
        let err = ApiError::Http {
            status: StatusCode::NOT_FOUND,
            detail: "Conversation not found".into(),
        }
        .scoped_to(&id);
        assert!(err.is_not_found());

        let err = ApiError::Http {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "boom".into(),
        }
        .scoped_to(&id);
        assert!(!err.is_not_found());
    }

    #[test]
    fn extract_detail_reads_backend_error_bodies() {
        assert_eq!(
            extract_detail(r#"{"detail": "Conversation not found"}"#).as_deref(),
            Some("Conversation not found")
        );
        // Validation failures arrive as structured details
        assert_eq!(
            extract_detail(r#"{"detail": [{"loc": ["body", "text"]}]}"#).as_deref(),
            Some(r#"[{"loc":["body","text"]}]"#)
        );
        assert_eq!(extract_detail("<html>bad gateway</html>"), None);
        assert_eq!(extract_detail(r#"{"message": "nope"}"#), None);
    }

    #[test]
    fn message_batch_tolerates_null_cursor() {
        let batch: MessageBatch =
            serde_json::from_str(r#"{"messages": [], "lastMessageId": null}"#).unwrap();
        assert!(batch.messages.is_empty());
        assert!(batch.last_message_id.is_none());

        let batch: MessageBatch = serde_json::from_str(r#"{"messages": []}"#).unwrap();
        assert!(batch.last_message_id.is_none());
    }

    #[test]
    fn message_batch_decodes_cursor() {
        let raw = r#"{
            "messages": [{
                "id": "4",
                "conversationId": "c1",
                "role": "doctor",
                "originalText": "does it hurt here?",
                "translatedText": "¿le duele aquí?",
                "createdAt": "2024-05-01T12:30:00Z"
            }],
            "lastMessageId": "4"
        }"#;
        let batch: MessageBatch = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.last_message_id, Some(MessageId::from("4")));
    }

    #[test]
    fn search_hit_uses_message_id_key() {
        let raw = r#"{
            "query": "head",
            "results": [{
                "messageId": "m2",
                "conversationId": "c1",
                "role": "patient",
                "originalText": "me duele la cabeza",
                "translatedText": "my head hurts",
                "createdAt": "2024-05-01T12:31:00Z"
            }],
            "totalCount": 1
        }"#;
        let response: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.total_count, 1);
        assert_eq!(response.results[0].message_id, MessageId::from("m2"));
    }

    #[test]
    fn summary_decodes_generated_at() {
        let raw = r#"{
            "conversationId": "c1",
            "summary": "Patient reports headache.",
            "generatedAt": "2024-05-01T13:00:00Z"
        }"#;
        let summary: ConversationSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.conversation_id, ConversationId::from("c1"));
        assert!(summary.summary.starts_with("Patient"));
    }
}
