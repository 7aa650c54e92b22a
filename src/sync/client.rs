//! Connecting side of a sync session.

use super::protocol::{check_hello, unexpected, Connection, Message, PROTOCOL_VERSION};
use super::{apply, reconcile, SyncReport};
use crate::config::SyncConfig;
use crate::error::{KeychainError, Result};
use crate::service::KeychainService;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::info;

/// Connect to a peer at `addr` and synchronize the store at `store_path`
/// with it.
pub async fn sync_with_peer(
    addr: &str,
    store_path: &Path,
    service: &KeychainService,
    config: &SyncConfig,
) -> Result<SyncReport> {
    let stream = tokio::time::timeout(config.timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| KeychainError::Timeout)??;
    info!(peer = %addr, "Connected to sync peer");

    let mut conn = Connection::new(stream, config.timeout());
    match run_client_session(&mut conn, store_path, service, &config.peer_name).await {
        Ok(report) => Ok(report),
        Err(e) => {
            if !matches!(e, KeychainError::Peer(_) | KeychainError::Timeout) {
                conn.send_error(&e).await;
            }
            Err(e)
        }
    }
}

pub(super) async fn run_client_session<S>(
    conn: &mut Connection<S>,
    store_path: &Path,
    service: &KeychainService,
    peer_name: &str,
) -> Result<SyncReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&Message::Hello {
        version: PROTOCOL_VERSION,
        peer: peer_name.to_string(),
    })
    .await?;
    let peer = check_hello(conn.recv().await?)?;

    let mut doc = service.load(store_path)?;
    conn.send(&Message::Snapshot {
        chains: doc.chains.clone(),
        links: doc.links.clone(),
    })
    .await?;

    let (chains, links) = match conn.recv().await? {
        Message::Snapshot { chains, links } => (chains, links),
        other => return Err(unexpected("snapshot", &other)),
    };

    let plan = reconcile(&doc, &chains, &links);
    let local = apply(&mut doc, plan);
    if !local.is_noop() {
        service.save(&doc, store_path)?;
    }

    conn.send(&Message::Done { stats: local }).await?;
    let remote = match conn.recv().await? {
        Message::Done { stats } => stats,
        other => return Err(unexpected("done", &other)),
    };

    info!(%peer, %local, %remote, "Sync finished");
    Ok(SyncReport {
        peer,
        local,
        remote,
    })
}
