// Copyright 2024. The Tari Project

use super::{sse_codec::SseCodec, ConsumerError, EventSource, FrameStream};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use std::io;
use tokio_util::{codec::FramedRead, io::StreamReader};

const LOG_TARGET: &str = "teamup::realtime::http_source";

/// Opens the server's event stream endpoint over HTTP
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    client: reqwest::Client,
    url: String,
    access_token: Option<String>,
}

impl HttpEventSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            access_token: None,
        }
    }

    /// Send `token` as the session bearer token
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Use a preconfigured client. It must not set a total request timeout,
    /// the stream is expected to stay open indefinitely.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl EventSource for HttpEventSource {
    async fn open(&self) -> Result<FrameStream, ConsumerError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        log::debug!(target: LOG_TARGET, "Opening event stream at {}", self.url);
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConsumerError::Status(status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if !content_type
            .as_deref()
            .is_some_and(|value| value.starts_with("text/event-stream"))
        {
            return Err(ConsumerError::ContentType(content_type));
        }

        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let frames = FramedRead::new(StreamReader::new(body), SseCodec::default())
            .map_ok(|message| message.data);

        Ok(frames.boxed())
    }
}
