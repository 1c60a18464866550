use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{info, warn};

use crate::{client_process::spawn_client_process, host::SessionHost};

pub struct HostServer {
    listener: TcpListener,
}

impl HostServer {
    /// Failing to bind is the one error that stops a host.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<HostServer> {
        let listener = TcpListener::bind(addr).await?;
        Ok(HostServer { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, host: Arc<SessionHost>) {
        if let Ok(addr) = self.local_addr() {
            info!("accepting peers on {addr}");
        }
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        warn!("could not set nodelay for {addr}: {e}");
                    }
                    info!("accepted connection from {addr}");
                    spawn_client_process(socket, addr, host.clone());
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
