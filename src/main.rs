//! vcalc-server: an authenticated vector summation service
//!
//! A client proves knowledge of the shared secret with a salted SHA-224
//! digest, then sends a batch of `u16` vectors. The server answers with
//! one saturating 16-bit sum per vector and closes the connection.
//!
//! Features:
//! - Compact and standard authentication message layouts
//! - Strict bounds checking on every length prefix
//! - One task per connection with read/write deadlines
//! - Configuration via CLI arguments or TOML file

mod auth;
mod calc;
mod config;
mod connection;
mod credentials;
mod logging;
mod protocol;
mod server;

use config::Config;
use credentials::CredentialStore;
use server::Server;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    logging::init(&config.log_level, &config.log_file);

    info!(
        listen = %config.listen_addr(),
        auth_file = %config.auth_file.display(),
        log_file = %config.log_file.display(),
        read_timeout_secs = config.read_timeout.as_secs(),
        write_timeout_secs = config.write_timeout.as_secs(),
        max_connections = config.max_connections,
        "Starting vcalc-server"
    );

    let credentials = CredentialStore::load(&config.auth_file).map_err(|e| {
        error!(error = %e, critical = true, "Failed to load authentication database");
        e
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::new(&config, &credentials);
        server.run().await
    })
}
