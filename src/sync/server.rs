//! Listening side of sync sessions.

use super::protocol::{check_hello, unexpected, Connection, Message, PROTOCOL_VERSION};
use super::{apply, reconcile, SyncReport};
use crate::config::SyncConfig;
use crate::error::{KeychainError, Result};
use crate::service::KeychainService;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Store shared by all sessions. The mutex serialises sessions so that two
/// peers never merge into the same file at once.
struct SharedStore {
    path: PathBuf,
    service: Arc<KeychainService>,
    lock: Mutex<()>,
    peer_name: String,
    timeout: Duration,
}

/// A running sync server.
pub struct SyncServer {
    /// The actual bound address.
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SyncServer {
    /// Bind and start accepting sessions in the background.
    pub async fn start(
        store_path: PathBuf,
        service: Arc<KeychainService>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let (listener, store) = bind(store_path, service, config).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "Starting sync server");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            tokio::select! {
                () = run_server(listener, store) => {
                    debug!("Server loop ended");
                }
                _ = shutdown_rx => {
                    info!("Received shutdown signal");
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// Bind, serve exactly one session and return its report.
    pub async fn serve_once(
        store_path: PathBuf,
        service: Arc<KeychainService>,
        config: &SyncConfig,
    ) -> Result<SyncReport> {
        let (listener, store) = bind(store_path, service, config).await?;
        info!(addr = %listener.local_addr()?, "Waiting for one sync peer");

        let (stream, peer_addr) = listener.accept().await?;
        info!(peer = %peer_addr, "Accepted sync connection");
        handle_connection(Connection::new(stream, store.timeout), &store).await
    }

    /// Stop the server and wait for the accept loop to end.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        info!("Sync server stopped");
    }

    fn stop_sync(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

async fn bind(
    store_path: PathBuf,
    service: Arc<KeychainService>,
    config: &SyncConfig,
) -> Result<(TcpListener, Arc<SharedStore>)> {
    // Fail early rather than on the first peer.
    service.load(&store_path)?;

    let listener = TcpListener::bind(config.bind_addr()).await?;
    let store = Arc::new(SharedStore {
        path: store_path,
        service,
        lock: Mutex::new(()),
        peer_name: config.peer_name.clone(),
        timeout: config.timeout(),
    });
    Ok((listener, store))
}

/// Run the server accept loop.
async fn run_server(listener: TcpListener, store: Arc<SharedStore>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let store = store.clone();
                tokio::spawn(async move {
                    debug!(peer = %peer_addr, "Accepted sync connection");
                    let conn = Connection::new(stream, store.timeout);
                    if let Err(e) = handle_connection(conn, &store).await {
                        warn!(peer = %peer_addr, error = %e, "Sync session failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

async fn handle_connection<S>(mut conn: Connection<S>, store: &SharedStore) -> Result<SyncReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match run_server_session(&mut conn, store).await {
        Ok(report) => Ok(report),
        Err(e) => {
            if !matches!(e, KeychainError::Peer(_) | KeychainError::Timeout) {
                conn.send_error(&e).await;
            }
            Err(e)
        }
    }
}

async fn run_server_session<S>(conn: &mut Connection<S>, store: &SharedStore) -> Result<SyncReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = check_hello(conn.recv().await?)?;
    conn.send(&Message::Hello {
        version: PROTOCOL_VERSION,
        peer: store.peer_name.clone(),
    })
    .await?;

    let (chains, links) = match conn.recv().await? {
        Message::Snapshot { chains, links } => (chains, links),
        other => return Err(unexpected("snapshot", &other)),
    };

    let local = {
        let _guard = store.lock.lock().await;
        let path: &Path = &store.path;
        let mut doc = store.service.load(path)?;

        conn.send(&Message::Snapshot {
            chains: doc.chains.clone(),
            links: doc.links.clone(),
        })
        .await?;

        let plan = reconcile(&doc, &chains, &links);
        let stats = apply(&mut doc, plan);
        if !stats.is_noop() {
            store.service.save(&doc, path)?;
        }
        stats
    };

    let remote = match conn.recv().await? {
        Message::Done { stats } => stats,
        other => return Err(unexpected("done", &other)),
    };
    conn.send(&Message::Done { stats: local }).await?;

    info!(%peer, %local, %remote, "Sync session finished");
    Ok(SyncReport {
        peer,
        local,
        remote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::sync::client::run_client_session;
    use tokio::io::duplex;

    fn service() -> Arc<KeychainService> {
        Arc::new(KeychainService::new().with_kdf(KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }))
    }

    #[tokio::test]
    async fn test_session_over_duplex() {
        let dir = tempfile::tempdir().unwrap();
        let service = service();

        let server_path = dir.path().join("server.json");
        let mut server_doc = service.init(&server_path, false).unwrap();
        service
            .create_chain(&mut server_doc, "Desk", "", "key")
            .unwrap();
        service.save(&server_doc, &server_path).unwrap();

        let client_path = dir.path().join("client.json");
        let mut client_doc = service.init(&client_path, false).unwrap();
        service
            .create_chain(&mut client_doc, "Phone", "", "key")
            .unwrap();
        service.save(&client_doc, &client_path).unwrap();

        let store = SharedStore {
            path: server_path.clone(),
            service: service.clone(),
            lock: Mutex::new(()),
            peer_name: "server".to_string(),
            timeout: Duration::from_secs(5),
        };

        let (a, b) = duplex(64 * 1024);
        let server = handle_connection(Connection::new(a, Duration::from_secs(5)), &store);
        let mut client_conn = Connection::new(b, Duration::from_secs(5));
        let client = run_client_session(&mut client_conn, &client_path, &service, "client");

        let (server_report, client_report) = tokio::join!(server, client);
        let server_report = server_report.unwrap();
        let client_report = client_report.unwrap();

        assert_eq!(server_report.peer, "client");
        assert_eq!(client_report.peer, "server");
        assert_eq!(server_report.local.created, 1);
        assert_eq!(client_report.local.created, 1);
        assert_eq!(server_report.remote, client_report.local);

        let server_doc = service.load(&server_path).unwrap();
        let client_doc = service.load(&client_path).unwrap();
        assert!(server_doc.find_chain_by_name("Phone").is_some());
        assert!(client_doc.find_chain_by_name("Desk").is_some());
    }

    #[tokio::test]
    async fn test_version_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let service = service();
        let path = dir.path().join("server.json");
        service.init(&path, false).unwrap();

        let store = SharedStore {
            path,
            service,
            lock: Mutex::new(()),
            peer_name: "server".to_string(),
            timeout: Duration::from_secs(5),
        };

        let (a, b) = duplex(4096);
        let server = handle_connection(Connection::new(a, Duration::from_secs(5)), &store);
        let client = async {
            let mut conn = Connection::new(b, Duration::from_secs(5));
            conn.send(&Message::Hello {
                version: PROTOCOL_VERSION + 1,
                peer: "future".to_string(),
            })
            .await
            .unwrap();
            conn.recv().await
        };

        let (server_result, client_result) = tokio::join!(server, client);
        assert!(matches!(server_result, Err(KeychainError::Protocol(_))));
        assert!(matches!(client_result, Err(KeychainError::Peer(m)) if m.contains("version")));
    }
}
