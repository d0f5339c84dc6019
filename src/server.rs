//! WebSocket listener for telephony media streams.
//!
//! Each accepted upgrade on the configured path becomes one
//! [`CallSession`]. Sessions share only the immutable [`SessionServices`].

use crate::config::{Config, SessionConfig};
use crate::defaults;
use crate::error::{RelayError, Result};
use crate::session::{CallSession, SessionServices};
use crate::upstream::LinkConfig;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

/// Accepts media-stream connections and runs a session for each.
pub struct RelayServer {
    listener: TcpListener,
    path: String,
    session_config: SessionConfig,
    link_config: LinkConfig,
    services: SessionServices,
}

impl RelayServer {
    /// Bind `server.listen` from the config.
    pub async fn bind(config: &Config, services: SessionServices) -> Result<Self> {
        let listener = TcpListener::bind(config.server.listen.as_str())
            .await
            .map_err(|e| RelayError::Other(format!("failed to bind {}: {e}", config.server.listen)))?;
        Ok(Self {
            listener,
            path: config.server.path.clone(),
            session_config: config.session.clone(),
            link_config: LinkConfig::from_config(config),
            services,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Calls already in progress keep running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %self.local_addr()?, path = %self.path, "listening for media streams");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; no longer accepting calls");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = Connection {
                            path: self.path.clone(),
                            session_config: self.session_config.clone(),
                            link_config: self.link_config.clone(),
                            services: self.services.clone(),
                        };
                        tokio::spawn(async move {
                            if let Err(e) = connection.serve(stream, peer).await {
                                warn!(%peer, error = %e, "media stream connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }
        }
    }
}

struct Connection {
    path: String,
    session_config: SessionConfig,
    link_config: LinkConfig,
    services: SessionServices,
}

impl Connection {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let expected = self.path.clone();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == expected {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some("not found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        let ws = match accept_hdr_async(stream, check_path).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%peer, error = %e, "upgrade rejected");
                return Ok(());
            }
        };
        info!(%peer, "media stream connected");

        let (mut outbound, mut inbound) = ws.split();
        let (tx, rx) = mpsc::channel(defaults::INBOUND_CHANNEL_CAPACITY);

        let reader = tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if tx.send(text.as_str().to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(%peer, error = %e, "media stream read error");
                        break;
                    }
                }
            }
        });

        let session = CallSession::new(self.session_config, self.link_config, self.services);
        let summary = session.run(rx).await;

        reader.abort();
        if let Err(e) = outbound.close().await {
            debug!(%peer, error = %e, "error closing media stream socket");
        }

        info!(
            %peer,
            call_sid = summary.call_sid.as_deref().unwrap_or("-"),
            frames = summary.frames_received,
            forwarded = summary.frames_forwarded,
            dropped = summary.frames_dropped,
            transcripts = summary.transcripts,
            replies = summary.replies_dispatched,
            "call finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::{CollectorSink, MockReplyGenerator, ReplyClient};
    use crate::stream::frame::{media_message, start_message, stop_message};
    use crate::upstream::MockConnector;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    fn services(connector: &MockConnector) -> SessionServices {
        SessionServices {
            connector: Arc::new(connector.clone()),
            replies: ReplyClient::new(
                Arc::new(MockReplyGenerator::new()),
                "fallback",
                Duration::from_secs(1),
            ),
            sink: Arc::new(CollectorSink::new()),
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.listen = "127.0.0.1:0".to_string();
        config.session.drain_delay = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_media_reaches_transcription_link() {
        let connector = MockConnector::new();
        let server = RelayServer::bind(&test_config(), services(&connector))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run_until(async move {
            stop_rx.await.ok();
        }));

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        ws.send(Message::text(start_message("CA77"))).await.unwrap();
        ws.send(Message::text(media_message(&[1, 2, 3]))).await.unwrap();
        ws.send(Message::text(media_message(&[4]))).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), connector.wait_for_submissions(2))
            .await
            .expect("audio never reached the link");
        assert_eq!(connector.submissions(), vec![vec![1, 2, 3], vec![4]]);

        ws.send(Message::text(stop_message())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), connector.wait_for_close_stream())
            .await
            .expect("link never closed");

        stop_tx.send(()).ok();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_paths_are_rejected() {
        let connector = MockConnector::new();
        let server = RelayServer::bind(&test_config(), services(&connector))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(server.run_until(std::future::pending()));

        let result = connect_async(format!("ws://{addr}/elsewhere")).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
            }
            Err(other) => panic!("Expected HTTP 404, got {other:?}"),
            Ok(_) => panic!("Expected HTTP 404, got an open socket"),
        }
        assert_eq!(connector.connect_count(), 0);
        server_task.abort();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let mut config = test_config();
        config.server.listen = "not an address".to_string();
        let result = RelayServer::bind(&config, services(&MockConnector::new())).await;
        assert!(result.is_err());
    }
}
