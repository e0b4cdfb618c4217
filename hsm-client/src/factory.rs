//! Socket factory used by a pool to create, validate and retire connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use hsm_common::{HsmError, HsmResult, Node, ProtocolCodec};

use crate::connection::{BoxedStream, Connection, ConnectionSettings};

#[derive(Clone)]
struct TlsTarget {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Creates connections to a single node.
pub struct ConnectionFactory {
    node: Node,
    codec: Arc<dyn ProtocolCodec>,
    connect_timeout: Duration,
    settings: ConnectionSettings,
    tls: Option<TlsTarget>,
    next_id: AtomicU64,
}

impl ConnectionFactory {
    pub fn new(
        node: Node,
        codec: Arc<dyn ProtocolCodec>,
        connect_timeout: Duration,
        settings: ConnectionSettings,
    ) -> Self {
        ConnectionFactory {
            node,
            codec,
            connect_timeout,
            settings,
            tls: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Wraps every new socket in TLS, verifying the peer as `server_name`.
    pub fn with_tls(mut self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        self.tls = Some(TlsTarget {
            connector,
            server_name,
        });
        self
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Opens a new socket and starts its read loop.
    pub async fn create(&self) -> HsmResult<Connection> {
        let addr = self.node.addr();
        let tcp = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(HsmError::Connection(format!(
                    "failed to connect to HSM {addr}: {err}"
                )))
            }
            Err(_) => {
                return Err(HsmError::Connection(format!(
                    "connect to HSM {addr} timed out after {}ms",
                    self.connect_timeout.as_millis()
                )))
            }
        };
        tcp.set_nodelay(true)?;

        let stream: BoxedStream = match &self.tls {
            Some(tls) => {
                let handshake = tls.connector.connect(tls.server_name.clone(), tcp);
                match tokio::time::timeout(self.connect_timeout, handshake).await {
                    Ok(Ok(stream)) => Box::new(stream),
                    Ok(Err(err)) => {
                        return Err(HsmError::Connection(format!(
                            "TLS handshake with HSM {addr} failed: {err}"
                        )))
                    }
                    Err(_) => {
                        return Err(HsmError::Connection(format!(
                            "TLS handshake with HSM {addr} timed out"
                        )))
                    }
                }
            }
            None => Box::new(tcp),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            node = %self.node,
            conn_id = id,
            tls = self.tls.is_some(),
            "created HSM socket connection"
        );
        Ok(Connection::from_stream(
            id,
            self.node.clone(),
            stream,
            Arc::clone(&self.codec),
            self.settings,
        ))
    }

    /// Liveness check applied on borrow.
    pub fn validate(&self, conn: &Connection) -> bool {
        conn.is_connected()
    }

    /// Closes a connection that is leaving the pool for good.
    pub async fn destroy(&self, conn: Connection) {
        debug!(conn = %conn, "destroying HSM connection");
        conn.close().await;
    }
}

#[cfg(test)]
mod tests {
    use hsm_common::UtimacoCodec;
    use tokio::net::TcpListener;

    use super::*;

    fn factory_for(node: Node) -> ConnectionFactory {
        ConnectionFactory::new(
            node,
            Arc::new(UtimacoCodec::new()),
            Duration::from_millis(500),
            ConnectionSettings::default(),
        )
    }

    #[tokio::test]
    async fn connects_and_assigns_increasing_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = tokio::spawn(async move {
            let mut sockets = Vec::new();
            for _ in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                sockets.push(socket);
            }
            sockets
        });

        let factory = factory_for(Node::new("127.0.0.1", port));
        let first = factory.create().await.unwrap();
        let second = factory.create().await.unwrap();
        assert!(second.id() > first.id());
        assert!(factory.validate(&first));

        let _sockets = acceptor.await.unwrap();
        factory.destroy(first).await;
        factory.destroy(second).await;
    }

    #[tokio::test]
    async fn refused_connect_is_connectivity_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = factory_for(Node::new("127.0.0.1", port)).create().await.err().unwrap();
        assert!(err.is_connectivity());
    }
}
