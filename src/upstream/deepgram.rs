//! Deepgram live-transcription transport over WebSocket.

use crate::config::TranscriptionConfig;
use crate::error::{RelayError, Result};
use crate::upstream::link::{TranscriptionConnector, UpstreamTransport};
use crate::upstream::protocol::ControlMessage;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens one listen socket per call.
#[derive(Debug, Clone)]
pub struct DeepgramConnector {
    config: TranscriptionConfig,
}

impl DeepgramConnector {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self { config }
    }

    /// Listen URL with the audio format and recognition options.
    pub fn listen_url(&self) -> String {
        let c = &self.config;
        let base = c.url.trim_end_matches('/');
        let separator = if base.contains('?') { '&' } else { '?' };
        format!(
            "{base}{separator}model={}&language={}&encoding={}&sample_rate={}&channels={}\
             &punctuate={}&smart_format={}&interim_results={}",
            c.model,
            c.language,
            c.encoding,
            c.sample_rate,
            c.channels,
            c.punctuate,
            c.smart_format,
            c.interim_results,
        )
    }
}

#[async_trait]
impl TranscriptionConnector for DeepgramConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamTransport>> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RelayError::LinkOpen {
                message: "no transcription API key configured (set DEEPGRAM_API_KEY)".to_string(),
            })?;

        let url = self.listen_url();
        debug!(url = %url, "connecting to transcription backend");

        let mut request = url.into_client_request().map_err(|e| RelayError::LinkOpen {
            message: format!("invalid listen URL: {e}"),
        })?;
        let auth = HeaderValue::from_str(&format!("Token {api_key}")).map_err(|e| {
            RelayError::LinkOpen {
                message: format!("API key is not a valid header value: {e}"),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| RelayError::LinkOpen {
                message: e.to_string(),
            })?;
        debug!(status = %response.status(), "transcription socket established");

        Ok(Box::new(DeepgramTransport { ws }))
    }

    fn name(&self) -> &str {
        "deepgram"
    }
}

struct DeepgramTransport {
    ws: WsStream,
}

#[async_trait]
impl UpstreamTransport for DeepgramTransport {
    async fn send_audio(&mut self, audio: Vec<u8>) -> Result<()> {
        self.ws.send(Message::binary(audio)).await?;
        Ok(())
    }

    async fn send_control(&mut self, control: ControlMessage) -> Result<()> {
        self.ws.send(Message::text(control.to_json())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "transcription backend sent close");
                    return None;
                }
                // Pings are answered by tungstenite
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_url_carries_audio_format() {
        let connector = DeepgramConnector::new(TranscriptionConfig::default());
        let url = connector.listen_url();

        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("model=nova-3"));
        assert!(url.contains("language=en-US"));
        assert!(url.contains("encoding=mulaw"));
        assert!(url.contains("sample_rate=8000"));
        assert!(url.contains("channels=1"));
        assert!(url.contains("punctuate=true"));
        assert!(url.contains("interim_results="));
        assert!(!url.contains(' '));
    }

    #[test]
    fn test_listen_url_appends_to_existing_query() {
        let config = TranscriptionConfig {
            url: "ws://localhost:9000/v1/listen?tier=test".to_string(),
            ..TranscriptionConfig::default()
        };
        let url = DeepgramConnector::new(config).listen_url();
        assert!(url.starts_with("ws://localhost:9000/v1/listen?tier=test&model="));
    }

    #[tokio::test]
    async fn test_connect_without_api_key_fails_fast() {
        let config = TranscriptionConfig {
            api_key: None,
            ..TranscriptionConfig::default()
        };
        let result = DeepgramConnector::new(config).connect().await;
        match result {
            Err(RelayError::LinkOpen { message }) => assert!(message.contains("DEEPGRAM_API_KEY")),
            Err(other) => panic!("Expected LinkOpen, got {other:?}"),
            Ok(_) => panic!("Expected LinkOpen, got a transport"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_link_open_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = TranscriptionConfig {
            api_key: Some("test-key".to_string()),
            url: format!("ws://{addr}/v1/listen"),
            ..TranscriptionConfig::default()
        };
        let result = DeepgramConnector::new(config).connect().await;
        assert!(matches!(result, Err(RelayError::LinkOpen { .. })));
    }
}
