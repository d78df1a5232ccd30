//! Per-connection state machine.
//!
//! A connection authenticates once, submits one vector batch, receives
//! the sums and is closed. No state is revisited.

use crate::protocol::{
    parse_auth, read_auth_message, read_batch, write_results, write_within, ProtocolError,
    AUTH_ERR, AUTH_OK,
};
use crate::server::ServiceContext;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    /// Waiting for the authentication message.
    Authenticating,
    /// `OK` sent, batch not yet read.
    Authenticated,
    /// Reading and summing vectors.
    ProcessingVectors,
    /// Writing the result batch.
    RespondingResults,
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Authentication failed for: {0}")]
    AuthFailed(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    peer: String,
    state: ConnState,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            state: ConnState::Connected,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    fn transition(&mut self, next: ConnState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Drive the connection to `Closed` and return the number of sums sent.
    /// The stream is shut down whatever the outcome.
    pub async fn run(&mut self, ctx: &ServiceContext) -> Result<usize, ConnectionError> {
        let result = self.serve(ctx).await;
        self.close(ctx).await;
        result
    }

    async fn serve(&mut self, ctx: &ServiceContext) -> Result<usize, ConnectionError> {
        self.authenticate(ctx).await?;

        self.transition(ConnState::ProcessingVectors);
        let sums = read_batch(&mut self.stream, ctx.read_timeout).await?;

        self.transition(ConnState::RespondingResults);
        write_results(&mut self.stream, &sums, ctx.write_timeout).await?;
        info!(peer = %self.peer, count = sums.len(), "Sent results to client");

        Ok(sums.len())
    }

    async fn authenticate(&mut self, ctx: &ServiceContext) -> Result<(), ConnectionError> {
        self.transition(ConnState::Authenticating);
        let message = read_auth_message(&mut self.stream, ctx.read_timeout).await?;
        info!(peer = %self.peer, length = message.len(), "Received auth message");

        let candidates = match parse_auth(&message) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.reject(ctx).await;
                return Err(e.into());
            }
        };

        // Readings are tried in priority order; the first that verifies wins.
        let mut accepted = None;
        for request in &candidates {
            info!(
                peer = %self.peer,
                layout = ?request.layout,
                login = %request.login_lossy(),
                "Auth attempt"
            );
            if ctx
                .verifier
                .verify(&request.login, &request.salt, &request.claimed_hash)
            {
                accepted = Some(request);
                break;
            }
        }

        let login = match accepted {
            Some(request) => request.login_lossy(),
            None => {
                self.reject(ctx).await;
                let login = candidates
                    .last()
                    .map(|request| request.login_lossy())
                    .unwrap_or_default();
                return Err(ConnectionError::AuthFailed(login));
            }
        };

        write_within(&mut self.stream, AUTH_OK, ctx.write_timeout).await?;
        self.transition(ConnState::Authenticated);
        info!(peer = %self.peer, login = %login, "Client authenticated");
        Ok(())
    }

    /// Send the rejection token. The connection is failing already, so a
    /// write error here is only logged.
    async fn reject(&mut self, ctx: &ServiceContext) {
        if let Err(e) = write_within(&mut self.stream, AUTH_ERR, ctx.write_timeout).await {
            debug!(peer = %self.peer, error = %e, "Failed to send rejection");
        }
    }

    async fn close(&mut self, ctx: &ServiceContext) {
        self.transition(ConnState::Closed);
        if let Ok(Err(e)) = tokio::time::timeout(ctx.write_timeout, self.stream.shutdown()).await {
            debug!(peer = %self.peer, error = %e, "Shutdown failed");
        }
    }
}

/// Serve one connection end to end.
pub async fn handle_connection<S>(
    stream: S,
    peer: &str,
    ctx: &ServiceContext,
) -> Result<usize, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Connection::new(stream, peer).run(ctx).await
}

impl ConnectionError {
    /// Whether the failure came from the peer's input rather than the socket.
    pub fn is_client_fault(&self) -> bool {
        !matches!(
            self,
            ConnectionError::Protocol(ProtocolError::Io(_))
                | ConnectionError::Protocol(ProtocolError::Timeout(_))
        )
    }
}
