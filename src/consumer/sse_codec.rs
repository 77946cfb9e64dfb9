// Copyright 2024. The Tari Project

use super::ConsumerError;
use bytes::BytesMut;
use std::time::Duration;
use tokio_util::codec::Decoder;

/// One dispatched `text/event-stream` message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<Duration>,
}

/// Incremental `text/event-stream` decoder.
///
/// Lines end with `\n`, an optional `\r` before it is dropped. Blocks without
/// any `data` line are not dispatched and an unterminated block at end of
/// stream is discarded.
#[derive(Debug, Default)]
pub struct SseCodec {
    /// Bytes of `src` already scanned for a line end
    scanned: usize,
    data: String,
    has_data: bool,
    event: Option<String>,
    id: Option<String>,
    retry: Option<Duration>,
}

impl SseCodec {
    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let has_data = std::mem::take(&mut self.has_data);
        let mut data = std::mem::take(&mut self.data);
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();

        if !has_data {
            return None;
        }
        if data.ends_with('\n') {
            data.pop();
        }
        Some(SseMessage { event, data, id, retry })
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Decoder for SseCodec {
    type Item = SseMessage;
    type Error = ConsumerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseMessage>, ConsumerError> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = src.len();
                return Ok(None);
            };

            let line = src.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            let mut line = &line[..line.len() - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if let Some(message) = self.process_line(&String::from_utf8_lossy(line)) {
                return Ok(Some(message));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SseMessage>, ConsumerError> {
        let message = self.decode(src)?;
        if message.is_none() {
            src.clear();
            self.reset();
        }
        Ok(message)
    }
}
