use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use meetbot_core::capability::ImageArtifact;
use meetbot_core::channel::{ChannelError, OutboundChannel, ProfileDirectory};
use meetbot_core::config::VkConfig;
use meetbot_core::session::UserId;

use crate::events::VkEnvelope;
use crate::longpoll::{LongPollTransport, TransportError};

/// Raster formats VK accepts as message photos; everything else goes out as a document.
const PHOTO_CONTENT_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif"];

#[derive(Debug, Error)]
pub enum VkApiError {
    #[error("vk http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vk api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("vk response could not be decoded: {0}")]
    Decode(String),
    #[error("vk upload failed: {0}")]
    Upload(String),
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    response: Option<T>,
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error_code: i64,
    error_msg: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LongPollServer {
    pub key: String,
    pub server: String,
    #[serde(deserialize_with = "string_or_number")]
    pub ts: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PollResponse {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub ts: Option<String>,
    #[serde(default)]
    pub updates: Vec<Value>,
    #[serde(default)]
    pub failed: Option<u8>,
}

#[derive(Deserialize)]
struct UploadServer {
    upload_url: String,
}

#[derive(Deserialize)]
struct UploadedPhoto {
    server: i64,
    photo: String,
    hash: String,
}

#[derive(Deserialize)]
struct UploadedFile {
    file: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct SavedMedia {
    id: i64,
    owner_id: i64,
    #[serde(default)]
    access_key: Option<String>,
}

#[derive(Deserialize)]
struct SavedDoc {
    doc: SavedMedia,
}

#[derive(Deserialize)]
struct UserInfo {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(other) => {
            Err(serde::de::Error::custom(format!("expected string or number, got {other}")))
        }
    }
}

fn media_attachment(kind: &str, media: &SavedMedia) -> String {
    match media.access_key.as_deref().filter(|key| !key.is_empty()) {
        Some(key) => format!("{kind}{}_{}_{key}", media.owner_id, media.id),
        None => format!("{kind}{}_{}", media.owner_id, media.id),
    }
}

fn display_name(first_name: &str, last_name: &str) -> Option<String> {
    let name = format!("{last_name} {first_name}").trim().to_owned();
    (!name.is_empty()).then_some(name)
}

/// Thin client over the VK HTTP API for one community.
pub struct VkApiClient {
    http: reqwest::Client,
    base_url: String,
    access_token: SecretString,
    api_version: String,
    group_id: u64,
    long_poll_wait_secs: u64,
}

impl VkApiClient {
    pub fn new(config: &VkConfig) -> Result<Self, VkApiError> {
        // The read timeout must outlive the server-side long poll wait.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.long_poll_wait_secs + 15))
            .build()?;
        Ok(Self::with_http(http, config))
    }

    pub fn with_http(http: reqwest::Client, config: &VkConfig) -> Self {
        Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            access_token: config.access_token.clone(),
            api_version: config.api_version.clone(),
            group_id: config.group_id,
            long_poll_wait_secs: config.long_poll_wait_secs,
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    async fn call<T>(&self, method: &str, params: &[(&str, String)]) -> Result<T, VkApiError>
    where
        T: DeserializeOwned,
    {
        let mut form: Vec<(&str, String)> = params.to_vec();
        form.push(("access_token", self.access_token.expose_secret().to_owned()));
        form.push(("v", self.api_version.clone()));

        let body: Value = self
            .http
            .post(format!("{}/{method}", self.base_url))
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let envelope: ApiEnvelope<T> = serde_json::from_value(body)
            .map_err(|error| VkApiError::Decode(format!("{method}: {error}")))?;
        if let Some(error) = envelope.error {
            return Err(VkApiError::Api { code: error.error_code, message: error.error_msg });
        }
        envelope
            .response
            .ok_or_else(|| VkApiError::Decode(format!("{method}: neither response nor error")))
    }

    pub async fn long_poll_server(&self) -> Result<LongPollServer, VkApiError> {
        self.call("groups.getLongPollServer", &[("group_id", self.group_id.to_string())]).await
    }

    /// One `a_check` request; blocks server-side for up to the configured wait.
    pub async fn poll(&self, server: &LongPollServer) -> Result<PollResponse, VkApiError> {
        let response = self
            .http
            .get(&server.server)
            .query(&[
                ("act", "a_check".to_owned()),
                ("key", server.key.clone()),
                ("ts", server.ts.clone()),
                ("wait", self.long_poll_wait_secs.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    pub async fn send_message(
        &self,
        user_id: UserId,
        text: Option<&str>,
        attachment: Option<&str>,
    ) -> Result<i64, VkApiError> {
        let mut params = vec![
            ("user_id", user_id.0.to_string()),
            ("random_id", rand::random::<i32>().to_string()),
            ("group_id", self.group_id.to_string()),
        ];
        if let Some(text) = text {
            params.push(("message", text.to_owned()));
        }
        if let Some(attachment) = attachment {
            params.push(("attachment", attachment.to_owned()));
        }

        self.call("messages.send", &params).await
    }

    /// Uploads the artifact and returns its `attachment` reference.
    pub async fn upload_attachment(
        &self,
        user_id: UserId,
        image: &ImageArtifact,
    ) -> Result<String, VkApiError> {
        if PHOTO_CONTENT_TYPES.contains(&image.content_type.as_str()) {
            self.upload_photo(user_id, image).await
        } else {
            self.upload_document(user_id, image).await
        }
    }

    async fn upload_photo(
        &self,
        user_id: UserId,
        image: &ImageArtifact,
    ) -> Result<String, VkApiError> {
        let target: UploadServer = self
            .call("photos.getMessagesUploadServer", &[("peer_id", user_id.0.to_string())])
            .await?;
        let uploaded: UploadedPhoto = self.post_file(&target.upload_url, "photo", image).await?;
        if uploaded.photo.is_empty() || uploaded.photo == "[]" {
            return Err(VkApiError::Upload(format!("photo `{}` was rejected", image.file_name)));
        }

        let saved: Vec<SavedMedia> = self
            .call(
                "photos.saveMessagesPhoto",
                &[
                    ("server", uploaded.server.to_string()),
                    ("photo", uploaded.photo),
                    ("hash", uploaded.hash),
                ],
            )
            .await?;
        let media = saved
            .first()
            .ok_or_else(|| VkApiError::Upload("saveMessagesPhoto returned nothing".to_owned()))?;
        Ok(media_attachment("photo", media))
    }

    async fn upload_document(
        &self,
        user_id: UserId,
        image: &ImageArtifact,
    ) -> Result<String, VkApiError> {
        let target: UploadServer = self
            .call(
                "docs.getMessagesUploadServer",
                &[("type", "doc".to_owned()), ("peer_id", user_id.0.to_string())],
            )
            .await?;
        let uploaded: UploadedFile = self.post_file(&target.upload_url, "file", image).await?;
        let file = match (uploaded.file, uploaded.error) {
            (Some(file), _) if !file.is_empty() => file,
            (_, Some(error)) => return Err(VkApiError::Upload(error)),
            _ => return Err(VkApiError::Upload("upload server returned no file".to_owned())),
        };

        let saved: SavedDoc = self
            .call("docs.save", &[("file", file), ("title", image.file_name.clone())])
            .await?;
        Ok(media_attachment("doc", &saved.doc))
    }

    async fn post_file<T>(
        &self,
        upload_url: &str,
        field: &'static str,
        image: &ImageArtifact,
    ) -> Result<T, VkApiError>
    where
        T: DeserializeOwned,
    {
        let part = Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)?;
        let body: Value = self
            .http
            .post(upload_url)
            .multipart(Form::new().part(field, part))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        serde_json::from_value(body).map_err(|error| VkApiError::Upload(error.to_string()))
    }

    /// "Last First" for the user, or `None` when VK knows no name.
    pub async fn user_display_name(&self, user_id: UserId) -> Result<Option<String>, VkApiError> {
        let users: Vec<UserInfo> =
            self.call("users.get", &[("user_ids", user_id.0.to_string())]).await?;
        Ok(users.first().and_then(|user| display_name(&user.first_name, &user.last_name)))
    }
}

#[async_trait]
impl OutboundChannel for VkApiClient {
    async fn send_text(&self, user_id: UserId, text: &str) -> Result<(), ChannelError> {
        let message_id = self
            .send_message(user_id, Some(text), None)
            .await
            .map_err(|error| ChannelError::Delivery(error.to_string()))?;
        info!(
            event_name = "egress.vk.message_sent",
            user_id = user_id.0,
            message_id,
            "response sent"
        );
        Ok(())
    }

    async fn send_image(
        &self,
        user_id: UserId,
        image: &ImageArtifact,
    ) -> Result<(), ChannelError> {
        let attachment = self
            .upload_attachment(user_id, image)
            .await
            .map_err(|error| ChannelError::Delivery(error.to_string()))?;
        let message_id = self
            .send_message(user_id, None, Some(&attachment))
            .await
            .map_err(|error| ChannelError::Delivery(error.to_string()))?;
        info!(
            event_name = "egress.vk.attachment_sent",
            user_id = user_id.0,
            message_id,
            attachment = %attachment,
            "attachment sent"
        );
        Ok(())
    }
}

#[async_trait]
impl ProfileDirectory for VkApiClient {
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, ChannelError> {
        self.user_display_name(user_id).await.map_err(|error| ChannelError::Profile(error.to_string()))
    }
}

/// Bots Long Poll session over [`VkApiClient`].
pub struct VkLongPollTransport {
    client: std::sync::Arc<VkApiClient>,
    server: Mutex<Option<LongPollServer>>,
}

impl VkLongPollTransport {
    pub fn new(client: std::sync::Arc<VkApiClient>) -> Self {
        Self { client, server: Mutex::new(None) }
    }

    async fn refresh(&self, keep_ts: Option<String>) -> Result<(), TransportError> {
        let mut fresh = self
            .client
            .long_poll_server()
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        if let Some(ts) = keep_ts {
            fresh.ts = ts;
        }
        *self.server.lock().await = Some(fresh);
        Ok(())
    }
}

#[async_trait]
impl LongPollTransport for VkLongPollTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.refresh(None).await?;
        info!(group_id = self.client.group_id(), "vk long poll server acquired");
        Ok(())
    }

    async fn next_batch(&self) -> Result<Option<Vec<VkEnvelope>>, TransportError> {
        let Some(server) = self.server.lock().await.clone() else {
            return Err(TransportError::Receive("long poll session is not connected".to_owned()));
        };

        let response = self
            .client
            .poll(&server)
            .await
            .map_err(|error| TransportError::Receive(error.to_string()))?;

        match response.failed {
            None => {}
            Some(1) => {
                debug!(failed = 1, "long poll history outdated; advancing ts");
                if let Some(ts) = response.ts {
                    if let Some(current) = self.server.lock().await.as_mut() {
                        current.ts = ts;
                    }
                }
                return Ok(Some(Vec::new()));
            }
            Some(2) => {
                debug!(failed = 2, "long poll key expired; refreshing key");
                self.refresh(Some(server.ts)).await?;
                return Ok(Some(Vec::new()));
            }
            Some(3) => {
                debug!(failed = 3, "long poll information lost; refreshing session");
                self.refresh(None).await?;
                return Ok(Some(Vec::new()));
            }
            Some(code) => {
                return Err(TransportError::Receive(format!("unknown long poll failure {code}")));
            }
        }

        let batch_ts = response.ts.clone().unwrap_or_else(|| server.ts.clone());
        let mut batch = Vec::with_capacity(response.updates.len());
        for (index, update) in response.updates.iter().enumerate() {
            match VkEnvelope::decode(update, &format!("{batch_ts}:{index}")) {
                Ok(envelope) => batch.push(envelope),
                Err(error) => warn!(
                    event_name = "ingress.vk.decode_failed",
                    ts = %batch_ts,
                    index,
                    error = %error,
                    "skipping undecodable long poll update"
                ),
            }
        }

        if let Some(ts) = response.ts {
            if let Some(current) = self.server.lock().await.as_mut() {
                current.ts = ts;
            }
        }
        Ok(Some(batch))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        *self.server.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::{Multipart, Path, Query, State};
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use meetbot_core::capability::ImageArtifact;
    use meetbot_core::channel::{OutboundChannel, ProfileDirectory};
    use meetbot_core::config::VkConfig;
    use meetbot_core::session::UserId;

    use super::{display_name, PollResponse, VkApiClient, VkApiError, VkLongPollTransport};
    use crate::events::VkEvent;
    use crate::longpoll::LongPollTransport;

    #[derive(Clone, Default)]
    struct MockVk {
        base: String,
        calls: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
        uploads: Arc<Mutex<Vec<(String, String)>>>,
        polls: Arc<Mutex<Vec<Value>>>,
    }

    impl MockVk {
        async fn calls_to(&self, method: &str) -> Vec<HashMap<String, String>> {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|(name, _)| name == method)
                .map(|(_, params)| params.clone())
                .collect()
        }
    }

    async fn method(
        State(mock): State<MockVk>,
        Path(name): Path<String>,
        Form(params): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        mock.calls.lock().await.push((name.clone(), params.clone()));
        let upload_url = format!("{}/upload", mock.base);
        Json(match name.as_str() {
            "groups.getLongPollServer" => {
                json!({"response": {"key": "k1", "server": format!("{}/poll", mock.base), "ts": 10}})
            }
            "messages.send" => json!({"response": 501}),
            "photos.getMessagesUploadServer" | "docs.getMessagesUploadServer" => {
                json!({"response": {"upload_url": upload_url}})
            }
            "photos.saveMessagesPhoto" => {
                json!({"response": [{"id": 457239017, "owner_id": -191590135}]})
            }
            "docs.save" => {
                json!({"response": {"type": "doc", "doc": {"id": 77, "owner_id": 8023886, "access_key": "ak"}}})
            }
            "users.get" if params.get("user_ids").map(String::as_str) == Some("1") => {
                json!({"response": [{"id": 1, "first_name": "", "last_name": ""}]})
            }
            "users.get" => {
                json!({"response": [{"id": 8023886, "first_name": "Владимир", "last_name": "Иванов"}]})
            }
            _ => json!({"error": {"error_code": 5, "error_msg": "User authorization failed"}}),
        })
    }

    async fn upload(State(mock): State<MockVk>, mut multipart: Multipart) -> Json<Value> {
        let mut field_name = String::new();
        let mut file_name = String::new();
        while let Ok(Some(field)) = multipart.next_field().await {
            field_name = field.name().unwrap_or_default().to_owned();
            file_name = field.file_name().unwrap_or_default().to_owned();
        }
        mock.uploads.lock().await.push((field_name.clone(), file_name));
        Json(if field_name == "photo" {
            json!({"server": 846221, "photo": "[{\"photo\":\"abc\"}]", "hash": "h"})
        } else {
            json!({"file": "doc-token"})
        })
    }

    async fn poll(
        State(mock): State<MockVk>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        assert_eq!(params.get("act").map(String::as_str), Some("a_check"));
        let mut polls = mock.polls.lock().await;
        Json(if polls.is_empty() { json!({"ts": "99", "updates": []}) } else { polls.remove(0) })
    }

    async fn start_mock() -> MockVk {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let mock = MockVk { base, ..MockVk::default() };
        let app = Router::new()
            .route("/method/{name}", post(method))
            .route("/upload", post(upload))
            .route("/poll", get(poll))
            .with_state(mock.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        mock
    }

    fn client(mock: &MockVk) -> VkApiClient {
        VkApiClient::new(&VkConfig {
            access_token: "token-1".to_owned().into(),
            group_id: 191590135,
            api_version: "5.103".to_owned(),
            api_base_url: format!("{}/method/", mock.base),
            long_poll_wait_secs: 1,
        })
        .expect("client")
    }

    fn artifact(file_name: &str, content_type: &str) -> ImageArtifact {
        ImageArtifact {
            file_name: file_name.to_owned(),
            content_type: content_type.to_owned(),
            bytes: b"<svg/>".to_vec(),
        }
    }

    #[test]
    fn display_name_is_last_then_first() {
        assert_eq!(display_name("Владимир", "Иванов").as_deref(), Some("Иванов Владимир"));
        assert_eq!(display_name("Vova", "").as_deref(), Some("Vova"));
        assert_eq!(display_name(" ", ""), None);
    }

    #[test]
    fn poll_response_accepts_numeric_and_string_ts() {
        let numeric: PollResponse =
            serde_json::from_value(json!({"ts": 12, "updates": []})).expect("numeric");
        assert_eq!(numeric.ts.as_deref(), Some("12"));

        let failed: PollResponse = serde_json::from_value(json!({"failed": 2})).expect("failed");
        assert_eq!(failed.failed, Some(2));
        assert!(failed.ts.is_none());
    }

    #[tokio::test]
    async fn send_text_posts_message_with_token_version_and_random_id() {
        let mock = start_mock().await;
        let client = client(&mock);

        client.send_text(UserId(8023886), "Привет!").await.expect("send");

        let calls = mock.calls_to("messages.send").await;
        assert_eq!(calls.len(), 1);
        let params = &calls[0];
        assert_eq!(params.get("user_id").map(String::as_str), Some("8023886"));
        assert_eq!(params.get("message").map(String::as_str), Some("Привет!"));
        assert_eq!(params.get("access_token").map(String::as_str), Some("token-1"));
        assert_eq!(params.get("v").map(String::as_str), Some("5.103"));
        assert!(params.get("random_id").is_some_and(|id| id.parse::<i32>().is_ok()));
    }

    #[tokio::test]
    async fn raster_images_go_through_photo_upload() {
        let mock = start_mock().await;
        let client = client(&mock);

        let attachment = client
            .upload_attachment(UserId(8023886), &artifact("ticket.png", "image/png"))
            .await
            .expect("upload");

        assert_eq!(attachment, "photo-191590135_457239017");
        assert_eq!(*mock.uploads.lock().await, vec![("photo".to_owned(), "ticket.png".to_owned())]);
        let saved = mock.calls_to("photos.saveMessagesPhoto").await;
        assert_eq!(saved[0].get("server").map(String::as_str), Some("846221"));
    }

    #[tokio::test]
    async fn vector_images_go_out_as_documents() {
        let mock = start_mock().await;
        let client = client(&mock);

        client
            .send_image(UserId(8023886), &artifact("ticket.svg", "image/svg+xml"))
            .await
            .expect("send image");

        assert_eq!(*mock.uploads.lock().await, vec![("file".to_owned(), "ticket.svg".to_owned())]);
        let sent = mock.calls_to("messages.send").await;
        assert_eq!(sent[0].get("attachment").map(String::as_str), Some("doc8023886_77_ak"));
        assert!(sent[0].get("message").is_none());
    }

    #[tokio::test]
    async fn api_errors_are_typed() {
        let mock = start_mock().await;
        let client = client(&mock);

        let error = client.call::<Value>("wall.post", &[]).await.expect_err("api error");
        assert!(matches!(error, VkApiError::Api { code: 5, .. }));
    }

    #[tokio::test]
    async fn profile_lookup_returns_last_first_or_none() {
        let mock = start_mock().await;
        let client = client(&mock);

        let name = client.display_name(UserId(8023886)).await.expect("lookup");
        assert_eq!(name.as_deref(), Some("Иванов Владимир"));

        let anonymous = client.display_name(UserId(1)).await.expect("lookup");
        assert_eq!(anonymous, None);
    }

    #[tokio::test]
    async fn transport_decodes_updates_and_recovers_from_failures() {
        let mock = start_mock().await;
        mock.polls.lock().await.extend([
            json!({"ts": "11", "updates": [
                {"type": "message_new", "object": {"message": {"from_id": 5, "peer_id": 5, "text": "Привет"}}},
                {"broken": true}
            ]}),
            json!({"failed": 1, "ts": 20}),
            json!({"failed": 2}),
            json!({"ts": "21", "updates": []}),
        ]);
        let transport = VkLongPollTransport::new(Arc::new(client(&mock)));

        transport.connect().await.expect("connect");
        let batch = transport.next_batch().await.expect("batch").expect("open stream");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_id, "11:0");
        assert!(matches!(batch[0].event, VkEvent::MessageNew(ref message) if message.text == "Привет"));

        assert_eq!(transport.next_batch().await.expect("failed=1"), Some(Vec::new()));
        assert_eq!(transport.server.lock().await.as_ref().map(|s| s.ts.clone()), Some("20".to_owned()));

        assert_eq!(transport.next_batch().await.expect("failed=2"), Some(Vec::new()));
        assert_eq!(mock.calls_to("groups.getLongPollServer").await.len(), 2);
        assert_eq!(transport.server.lock().await.as_ref().map(|s| s.ts.clone()), Some("20".to_owned()));

        assert_eq!(transport.next_batch().await.expect("empty"), Some(Vec::new()));
        transport.disconnect().await.expect("disconnect");
        assert!(transport.next_batch().await.is_err());
    }
}
