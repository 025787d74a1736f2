//! TCP listener that turns accepted connections into sessions.

use std::{io, sync::Arc};

use log::{info, warn};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::error::HostError;
use crate::host::DeviceHost;
use crate::registry::ShareRegistry;
use crate::session::{Session, SessionContext};

/// The USB/IP server: accepts connections and runs one [`Session`] per
/// connection until shut down.
pub struct Server<H: DeviceHost> {
    ctx: Arc<SessionContext<H>>,
}

impl<H: DeviceHost> Server<H> {
    /// Build a server. Verifies the capture driver first; an incompatible
    /// driver is fatal here, before any socket is bound.
    pub fn new(host: H, registry: ShareRegistry) -> Result<Server<H>, HostError> {
        host.verify_driver()?;
        Ok(Server {
            ctx: Arc::new(SessionContext { host, registry }),
        })
    }

    pub fn context(&self) -> &Arc<SessionContext<H>> {
        &self.ctx
    }

    /// Accept loop. Each session runs in its own task; a failing session
    /// never affects the others. When `shutdown` fires, stops accepting,
    /// signals every active session, and waits for their orderly detach.
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        info!("listening on {}", listener.local_addr()?);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    info!("connection from {peer}");
                    let session = Session::new(self.ctx.clone(), peer);
                    let session_shutdown = shutdown.clone();
                    sessions.spawn(async move {
                        if let Err(e) = session.run(stream, session_shutdown).await {
                            warn!("{peer}: session ended: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
        info!("shutting down, waiting for {} session(s)", sessions.len());
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::{device, MockHost};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_concurrent_devlist_clients_over_tcp() {
        let host = MockHost::new(vec![device("1-2", 1, 2)]);
        let registry = ShareRegistry::in_memory();
        registry.share("1-2", "Widget").unwrap();
        let server = Server::new(host, registry).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move { server.run(listener, shutdown_rx).await });

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        for client in &mut clients {
            client
                .write_all(&[0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0])
                .await
                .unwrap();
            let mut reply = [0u8; 12];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply[..8], &[0x01, 0x11, 0x00, 0x05, 0, 0, 0, 0]);
            assert_eq!(&reply[8..], &[0, 0, 0, 1]);
        }

        shutdown_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn one_failing_session_does_not_stop_the_listener() {
        let host = MockHost::new(vec![]);
        let server = Server::new(host, ShareRegistry::in_memory()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move { server.run(listener, shutdown_rx).await });

        // A client that speaks garbage.
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(&[0xff; 8]).await.unwrap();
        drop(bad);

        // The listener must still serve the next client.
        let mut good = TcpStream::connect(addr).await.unwrap();
        good.write_all(&[0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 12];
        good.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[8..], &[0, 0, 0, 0]);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }
}
