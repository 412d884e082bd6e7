use std::sync::Arc;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    multipart::{Form, Part},
    Client, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use shared::error::ApiErrorBody;
use tracing::{debug, warn};

use crate::{
    error::ClientError,
    refresh::RefreshOrchestrator,
    session::SessionContext,
};

#[derive(Debug, Clone)]
pub enum MultipartValue {
    Text(String),
    File {
        filename: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct MultipartField {
    pub name: String,
    pub value: MultipartValue,
}

#[derive(Debug, Clone, Default)]
pub struct MultipartPayload {
    pub fields: Vec<MultipartField>,
}

impl MultipartPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(MultipartField {
            name: name.into(),
            value: MultipartValue::Text(value.into()),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.fields.push(MultipartField {
            name: name.into(),
            value: MultipartValue::File {
                filename: filename.into(),
                mime_type,
                bytes,
            },
        });
        self
    }

    fn to_form(&self) -> Result<Form, ClientError> {
        let mut form = Form::new();
        for field in &self.fields {
            form = match &field.value {
                MultipartValue::Text(text) => form.text(field.name.clone(), text.clone()),
                MultipartValue::File {
                    filename,
                    mime_type,
                    bytes,
                } => {
                    let mut part = Part::bytes(bytes.clone()).file_name(filename.clone());
                    if let Some(mime_type) = mime_type {
                        part = part.mime_str(mime_type).map_err(|err| {
                            ClientError::InvalidRequest(format!(
                                "invalid mime type '{mime_type}' for field '{}': {err}",
                                field.name
                            ))
                        })?;
                    }
                    form.part(field.name.clone(), part)
                }
            };
        }
        Ok(form)
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Multipart(MultipartPayload),
    Raw {
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ClientError> {
        let value = serde_json::to_value(body)
            .map_err(|err| ClientError::InvalidRequest(format!("unserializable body: {err}")))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn multipart(mut self, payload: MultipartPayload) -> Self {
        self.body = RequestBody::Multipart(payload);
        self
    }

    pub fn raw(mut self, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        self.body = RequestBody::Raw {
            content_type,
            bytes,
        };
        self
    }

    fn has_caller_authorization(&self) -> bool {
        self.headers.contains_key(AUTHORIZATION)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Empty,
    Body(serde_json::Value),
}

struct Attempt {
    response: reqwest::Response,
    injected_token: Option<String>,
}

/// Every outbound REST call goes through here: bearer injection, body
/// encoding, error mapping and the one recoverable failure (a 401 on an
/// expired access token, answered by refresh and a single retry).
pub struct Gateway {
    http: Client,
    api_root: String,
    session: Arc<SessionContext>,
    refresher: Arc<RefreshOrchestrator>,
}

impl Gateway {
    pub fn new(
        http: Client,
        api_root: impl Into<String>,
        session: Arc<SessionContext>,
        refresher: Arc<RefreshOrchestrator>,
    ) -> Self {
        Self {
            http,
            api_root: api_root.into(),
            session,
            refresher,
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn refresher(&self) -> &Arc<RefreshOrchestrator> {
        &self.refresher
    }

    pub async fn execute(
        &self,
        request: &RequestDescriptor,
        retry_allowed: bool,
    ) -> Result<ApiResponse, ClientError> {
        let first = self.send_once(request).await?;
        if first.response.status() != StatusCode::UNAUTHORIZED {
            return finish(first.response).await;
        }

        // A caller-supplied Authorization header is not ours to renew.
        let Some(rejected_token) = first.injected_token.filter(|_| retry_allowed) else {
            return finish(first.response).await;
        };

        if !self.session.can_refresh().await {
            debug!(path = %request.path, "gateway: 401 without refresh token");
            return Err(ClientError::Auth(
                "access token rejected and no refresh token is available".into(),
            ));
        }

        debug!(path = %request.path, "gateway: 401, refreshing access token");
        self.refresher
            .refresh_after_rejection(&rejected_token)
            .await?;

        let retry = self.send_once(request).await?;
        if retry.response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %request.path, "gateway: renewed token rejected on retry");
        }
        finish(retry.response).await
    }

    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: &RequestDescriptor,
    ) -> Result<T, ClientError> {
        match self.execute(request, true).await? {
            ApiResponse::Body(value) => serde_json::from_value(value)
                .map_err(|err| ClientError::Decode(err.to_string())),
            ApiResponse::Empty => Err(ClientError::Decode(format!(
                "expected a body from {} {}",
                request.method, request.path
            ))),
        }
    }

    pub async fn execute_unit(&self, request: &RequestDescriptor) -> Result<(), ClientError> {
        self.execute(request, true).await.map(|_| ())
    }

    async fn send_once(&self, request: &RequestDescriptor) -> Result<Attempt, ClientError> {
        let url = format!("{}{}", self.api_root, request.path);
        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        let mut headers = request.headers.clone();
        let injected_token = if request.has_caller_authorization() {
            None
        } else {
            match self.session.access_token().await {
                Some(token) => {
                    let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                        ClientError::Auth("stored access token is not a valid header value".into())
                    })?;
                    headers.insert(AUTHORIZATION, value);
                    Some(token)
                }
                None => None,
            }
        };

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(payload) => {
                // The transport writes Content-Type with the boundary.
                headers.remove(CONTENT_TYPE);
                builder.multipart(payload.to_form()?)
            }
            RequestBody::Raw {
                content_type,
                bytes,
            } => {
                if let Some(content_type) = content_type {
                    let value = HeaderValue::from_str(content_type).map_err(|_| {
                        ClientError::InvalidRequest(format!(
                            "invalid content type '{content_type}'"
                        ))
                    })?;
                    headers.insert(CONTENT_TYPE, value);
                }
                builder.body(bytes.clone())
            }
        };

        let response = builder
            .headers(headers)
            .send()
            .await
            .map_err(ClientError::Network)?;
        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status().as_u16(),
            "gateway: response"
        );
        Ok(Attempt {
            response,
            injected_token,
        })
    }
}

async fn finish(response: reqwest::Response) -> Result<ApiResponse, ClientError> {
    let status = response.status();
    let body = response.bytes().await.map_err(ClientError::Network)?;

    if !status.is_success() {
        return Err(ClientError::Http {
            status: status.as_u16(),
            message: error_message_from_body(status, &body),
        });
    }

    if status == StatusCode::NO_CONTENT || status == StatusCode::RESET_CONTENT || body.is_empty() {
        return Ok(ApiResponse::Empty);
    }

    serde_json::from_slice(&body)
        .map(ApiResponse::Body)
        .map_err(|err| ClientError::Decode(err.to_string()))
}

pub(crate) fn error_message_from_body(status: StatusCode, body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ApiErrorBody>(body) {
        if let Some(message) = parsed.best_message() {
            return message.to_string();
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if !text.is_empty() {
        return text.to_string();
    }

    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
