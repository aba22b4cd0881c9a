//! WebSocket transport

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::NetworkError;
use crate::network::transport::{Connection, Connector};
use crate::protocol::TransportMessage;

/// Opens `ws://` connections
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&mut self, url: String) -> BoxFuture<'static, Result<Box<dyn Connection>, NetworkError>> {
        Box::pin(async move {
            let (stream, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", url, e)))?;
            Ok(Box::new(WsConnection { stream }) as Box<dyn Connection>)
        })
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    fn next_message(&mut self) -> BoxFuture<'_, Option<Result<TransportMessage, NetworkError>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(TransportMessage::Text(text))),
                    Ok(Message::Binary(data)) => {
                        return Some(Ok(TransportMessage::Binary(data.into())))
                    }
                    Ok(Message::Close(_)) => return None,
                    // Pings are answered by tungstenite itself
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                    Err(e) => return Some(Err(NetworkError::ReceiveFailed(e.to_string()))),
                }
            }
        })
    }

    fn close(&mut self, code: u16, reason: String) -> BoxFuture<'_, Result<(), NetworkError>> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            self.stream
                .close(Some(frame))
                .await
                .map_err(|e| NetworkError::CloseFailed(e.to_string()))
        })
    }
}
