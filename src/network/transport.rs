//! Transport abstraction
//!
//! A transport delivers whole messages (text or binary) and can be closed with
//! a status code. The supervisor only ever talks to these traits, so the
//! WebSocket implementation can be swapped for an in-memory one in tests.

use futures_util::future::BoxFuture;

use crate::error::NetworkError;
use crate::protocol::TransportMessage;

/// One live connection
pub trait Connection: Send {
    /// Next message; `None` once the peer has closed. Must be cancel-safe.
    fn next_message(&mut self) -> BoxFuture<'_, Option<Result<TransportMessage, NetworkError>>>;

    fn close(&mut self, code: u16, reason: String) -> BoxFuture<'_, Result<(), NetworkError>>;
}

/// Opens connections to a URL
pub trait Connector: Send {
    fn connect(&mut self, url: String) -> BoxFuture<'static, Result<Box<dyn Connection>, NetworkError>>;
}

#[cfg(test)]
pub(crate) mod memory {
    //! Scripted in-memory transport

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Everything the supervisor did to the transport
    #[derive(Default)]
    pub(crate) struct TransportLog {
        pub urls: Vec<String>,
        pub closes: Vec<(u16, String)>,
    }

    pub(crate) struct MemoryConnector {
        sessions: Arc<Mutex<VecDeque<mpsc::UnboundedReceiver<TransportMessage>>>>,
        log: Arc<Mutex<TransportLog>>,
    }

    impl MemoryConnector {
        pub(crate) fn new() -> (Self, Arc<Mutex<TransportLog>>) {
            let log = Arc::new(Mutex::new(TransportLog::default()));
            let connector = Self {
                sessions: Arc::new(Mutex::new(VecDeque::new())),
                log: log.clone(),
            };
            (connector, log)
        }

        /// Queue a session for the next connect; returns the server side
        pub(crate) fn add_session(&self) -> mpsc::UnboundedSender<TransportMessage> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.sessions.lock().push_back(rx);
            tx
        }
    }

    impl Connector for MemoryConnector {
        fn connect(&mut self, url: String) -> BoxFuture<'static, Result<Box<dyn Connection>, NetworkError>> {
            self.log.lock().urls.push(url.clone());
            let session = self.sessions.lock().pop_front();
            let log = self.log.clone();
            Box::pin(async move {
                match session {
                    Some(rx) => Ok(Box::new(MemoryConnection { rx, log }) as Box<dyn Connection>),
                    None => Err(NetworkError::ConnectionFailed(format!("{} refused", url))),
                }
            })
        }
    }

    struct MemoryConnection {
        rx: mpsc::UnboundedReceiver<TransportMessage>,
        log: Arc<Mutex<TransportLog>>,
    }

    impl Connection for MemoryConnection {
        fn next_message(&mut self) -> BoxFuture<'_, Option<Result<TransportMessage, NetworkError>>> {
            Box::pin(async move { self.rx.recv().await.map(Ok) })
        }

        fn close(&mut self, code: u16, reason: String) -> BoxFuture<'_, Result<(), NetworkError>> {
            self.log.lock().closes.push((code, reason));
            Box::pin(async { Ok(()) })
        }
    }
}
