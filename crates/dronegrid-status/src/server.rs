//! Status server lifecycle: bind, serve, cooperative shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::StatusResult;
use crate::{StatusState, status_router};

const POKE_TIMEOUT: Duration = Duration::from_secs(2);

/// A running status server.
pub struct StatusServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl StatusServer {
    /// Bind `addr` and start serving in the background.
    pub async fn start(addr: SocketAddr, state: StatusState) -> StatusResult<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let router = status_router(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });
        info!(addr = %local_addr, "status server listening");
        Ok(Self {
            local_addr,
            shutdown_tx,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, send one last loopback request so a parked accept
    /// wakes up, and wait for in-flight requests to finish.
    pub async fn shutdown(self) -> StatusResult<()> {
        info!("status server shutting down");
        let _ = self.shutdown_tx.send(true);
        poke(self.local_addr).await;
        self.handle.await??;
        info!("status server stopped");
        Ok(())
    }
}

/// Fire a bare `GET /` at the server. Failure is expected once the
/// listener has closed.
async fn poke(addr: SocketAddr) {
    let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
    let uri = format!("http://{target}/");

    let result = tokio::time::timeout(POKE_TIMEOUT, async {
        let stream = tokio::net::TcpStream::connect(target).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(std::io::Error::other)?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", target.to_string())
            .header("user-agent", "dronegrid-status/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(std::io::Error::other)?;
        let resp = sender
            .send_request(req)
            .await
            .map_err(std::io::Error::other)?;
        Ok::<_, std::io::Error>(resp.status())
    })
    .await;

    match result {
        Ok(Ok(status)) => debug!(%status, "shutdown poke answered"),
        Ok(Err(e)) => debug!(error = %e, "shutdown poke not answered"),
        Err(_) => debug!("shutdown poke timed out"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::snapshot::StatusSnapshot;

    #[tokio::test]
    async fn serves_then_shuts_down() {
        let (_snapshot_tx, snapshot) = watch::channel(StatusSnapshot::default());
        let (reconfigure, _rx) = mpsc::channel(1);
        let server = StatusServer::start(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            StatusState {
                snapshot,
                reconfigure,
            },
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let stream = tokio::net::TcpStream::connect(addr).await;
        assert!(stream.is_ok());
        drop(stream);

        server.shutdown().await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
