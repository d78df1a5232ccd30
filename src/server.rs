//! TCP server for the vector summation service.
//!
//! Accepts connections and serves each one on its own task. Handlers share
//! only the read-only [`ServiceContext`].

use crate::auth::HashVerifier;
use crate::config::Config;
use crate::connection::handle_connection;
use crate::credentials::CredentialStore;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Pending connection queue length
const LISTEN_BACKLOG: i32 = 128;

/// Read-only state shared by every connection handler
#[derive(Debug)]
pub struct ServiceContext {
    pub verifier: HashVerifier,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl ServiceContext {
    pub fn new(
        verifier: HashVerifier,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            read_timeout,
            write_timeout,
        }
    }
}

/// Server instance
pub struct Server {
    listen: String,
    context: Arc<ServiceContext>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance. The credential store is only checked
    /// for the service account; it is not consulted per connection.
    pub fn new(config: &Config, credentials: &CredentialStore) -> Self {
        let verifier = HashVerifier::default();
        if !credentials.contains(verifier.account()) {
            warn!(
                account = verifier.account(),
                "Auth file does not list the service account"
            );
        }

        let context = ServiceContext::new(verifier, config.read_timeout, config.write_timeout);

        Server {
            listen: config.listen_addr(),
            context: Arc::new(context),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        }
    }

    /// Bind the listener and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = bind_listener(&self.listen).map_err(|e| {
            error!(address = %self.listen, error = %e, critical = true, "Failed to bind socket");
            e
        })?;
        info!(address = %self.listen, "Server listening");

        tokio::select! {
            result = self.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
        }
    }

    /// Accept connections from `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(peer = %addr, "New client connected");

                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        let peer = addr.to_string();
                        match handle_connection(stream, &peer, &context).await {
                            Ok(count) => debug!(peer = %peer, count, "Connection complete"),
                            Err(e) if e.is_client_fault() => {
                                error!(peer = %peer, error = %e, critical = false, "Client rejected")
                            }
                            Err(e) => {
                                error!(peer = %peer, error = %e, critical = false, "Connection error")
                            }
                        }
                        info!(peer = %peer, "Client disconnected");
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, critical = false, "Failed to accept client connection");
                }
            }
        }
    }
}

/// Bind a listening socket with `SO_REUSEADDR` set.
pub fn bind_listener(listen: &str) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = listen.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("no address resolved for {listen}"),
        )
    })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
