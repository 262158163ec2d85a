//! Named pipe listener for the control API on Windows.

use std::io;
use std::time::Duration;

use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tracing::warn;

/// Accepts one client per pipe instance, creating the next instance as soon
/// as the current one is connected.
pub struct PipeListener {
    name: String,
    next: NamedPipeServer,
}

impl PipeListener {
    pub fn bind(name: &str) -> io::Result<Self> {
        let next = ServerOptions::new().first_pipe_instance(true).create(name)?;
        Ok(Self {
            name: name.to_string(),
            next,
        })
    }
}

impl axum::serve::Listener for PipeListener {
    type Io = NamedPipeServer;
    type Addr = String;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        while let Err(e) = self.next.connect().await {
            warn!(pipe = %self.name, error = %e, "Pipe connect failed");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // The current instance is connected; only the next one is retried.
        loop {
            match ServerOptions::new().create(&self.name) {
                Ok(fresh) => {
                    let connected = std::mem::replace(&mut self.next, fresh);
                    return (connected, self.name.clone());
                }
                Err(e) => {
                    warn!(pipe = %self.name, error = %e, "Failed to create next pipe instance");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.name.clone())
    }
}
