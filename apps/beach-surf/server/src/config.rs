use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use beach_surf_core::Keyring;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "beach-surf-server",
    author,
    version,
    about = "Beach Surf live view server"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_SURF_LISTEN_ADDR", default_value = "127.0.0.1:4180")]
    pub listen_addr: String,

    /// Session signing keys as `kid=secret`. The first key signs new
    /// sessions; the rest are only accepted when verifying.
    #[arg(
        long = "signing-key",
        env = "BEACH_SURF_SIGNING_KEYS",
        value_delimiter = ',',
        required = true
    )]
    pub signing_keys: Vec<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_SURF_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Per-instance queue depth for inbound events and outbound pushes.
    #[arg(long, env = "BEACH_SURF_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub keyring: Keyring,
    pub shutdown_grace: Duration,
    pub outbound_buffer: usize,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let keyring = parse_keyring(&cli.signing_keys)?;
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must be greater than zero");
        }
        Ok(ServerConfig {
            listen_addr,
            keyring,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            outbound_buffer: cli.outbound_buffer,
        })
    }
}

pub fn parse_keyring(entries: &[String]) -> Result<Keyring> {
    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((kid, secret)) = entry.split_once('=') else {
            bail!("signing key must look like kid=secret (got an entry without '=')");
        };
        let kid = kid.trim();
        if !kid
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            bail!("signing key id `{kid}` may only contain ASCII letters, digits, '-' and '_'");
        }
        parsed.push((kid.to_string(), secret.as_bytes().to_vec()));
    }
    Keyring::new(parsed).context("invalid signing key configuration")
}
