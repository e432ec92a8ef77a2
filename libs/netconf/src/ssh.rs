//! ssh transport: connect, authenticate, open a session channel and start
//! the `netconf` subsystem on it.
use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use russh::client;
use russh_keys::key;
use tracing::{debug, info, warn};

use config::Controller;

use crate::{
    error::{NetconfError, NetconfResult},
    session::{Connector, Transport},
};

const SUBSYSTEM: &str = "netconf";

struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // controllers are reached over a management network with rotating host
    // keys, the key is logged and accepted
    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(host = %self.host, fingerprint = %server_public_key.fingerprint(), "accepting controller host key");
        Ok(true)
    }
}

/// Connects to the controller over ssh.
#[derive(Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    username: String,
    private_key_file: Option<PathBuf>,
    password: Option<String>,
    keepalive: Duration,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("peer", &self.peer())
            .field("private_key_file", &self.private_key_file)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SshConnector {
    pub fn new(controller: &Controller) -> Self {
        Self {
            host: controller.host.clone(),
            port: controller.port,
            username: controller.username.clone(),
            private_key_file: controller.credentials.private_key_file.clone(),
            password: controller.credentials.password.clone(),
            keepalive: controller.keepalive,
        }
    }

    /// private key first, then password
    async fn authenticate(&self, handle: &mut client::Handle<ClientHandler>) -> NetconfResult<()> {
        if let Some(path) = &self.private_key_file {
            match russh_keys::load_secret_key(path, None) {
                Ok(key) => {
                    let accepted = handle
                        .authenticate_publickey(self.username.clone(), Arc::new(key))
                        .await
                        .map_err(transport)?;
                    if accepted {
                        debug!(user = %self.username, "authenticated with private key");
                        return Ok(());
                    }
                    warn!(user = %self.username, key = %path.display(), "private key rejected");
                }
                Err(err) => {
                    warn!(?err, key = %path.display(), "failed to load private key");
                }
            }
        }
        if let Some(password) = &self.password {
            let accepted = handle
                .authenticate_password(self.username.clone(), password.clone())
                .await
                .map_err(transport)?;
            if accepted {
                debug!(user = %self.username, "authenticated with password");
                return Ok(());
            }
            warn!(user = %self.username, "password rejected");
        }
        Err(NetconfError::Auth {
            user: self.username.clone(),
        })
    }
}

fn transport(err: russh::Error) -> NetconfError {
    NetconfError::Transport(err.to_string())
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self) -> NetconfResult<Transport> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.keepalive),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = ClientHandler {
            host: self.host.clone(),
        };
        let mut handle = client::connect(config, (self.host.as_str(), self.port), handler)
            .await
            .map_err(transport)?;
        self.authenticate(&mut handle).await?;

        let channel = handle.channel_open_session().await.map_err(transport)?;
        channel
            .request_subsystem(true, SUBSYSTEM)
            .await
            .map_err(transport)?;
        info!(peer = %self.peer(), "netconf subsystem started");

        let (reader, writer) = tokio::io::split(channel.into_stream());
        Ok(Transport {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: Some(Box::new(handle)),
        })
    }

    fn peer(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}
