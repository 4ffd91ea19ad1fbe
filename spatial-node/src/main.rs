//! Headless spatial collaboration node.
//!
//! ```bash
//! # Run a relay server
//! spatial-node relay --bind 0.0.0.0:9090
//!
//! # Host a session and share a diagram
//! spatial-node host --name Studio --diagram architecture.json --relay ws://relay:9090
//!
//! # Join a host on the local network
//! spatial-node join --name Viewer --peer 192.168.1.20:7878
//! ```

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use spatial_collab::config::{DirectConfig, RelayConfig, Role, SessionConfig};
use spatial_collab::hooks::{SessionObserver, StaticPoseProvider};
use spatial_collab::server::{RelayServer, RelayServerConfig};
use spatial_collab::session::{SessionBuilder, SessionHandle};
use spatial_collab::transport::PeerInfo;
use spatial_core::{Element, Matrix4, SharedAnchor};

type BoxError = Box<dyn Error + Send + Sync>;

/// Shared spatial diagrams over direct links and relay groups
#[derive(Parser)]
#[command(name = "spatial-node")]
#[command(version = "0.1.0")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Relay {
        #[arg(long, default_value = "0.0.0.0:9090")]
        bind: String,
        #[arg(long, default_value_t = 16)]
        max_members: usize,
    },

    /// Host a session
    Host {
        #[command(flatten)]
        node: NodeArgs,
        /// Direct transport listen address
        #[arg(long, default_value = "0.0.0.0:7878")]
        bind: String,
        /// Diagram files (JSON array of elements) to share once hosting
        #[arg(long)]
        diagram: Vec<PathBuf>,
    },

    /// Join a session
    Join {
        #[command(flatten)]
        node: NodeArgs,
        /// Host addresses to try (host:port)
        #[arg(long)]
        peer: Vec<String>,
    },
}

#[derive(Args)]
struct NodeArgs {
    /// Name announced to peers
    #[arg(long, default_value = "Spatial Node")]
    name: String,
    /// Relay server URL
    #[arg(long)]
    relay: Option<String>,
    /// Relay group name
    #[arg(long, default_value = "default")]
    group: String,
    /// Where to persist the shared anchor
    #[arg(long)]
    anchor_file: Option<PathBuf>,
}

impl NodeArgs {
    fn session_config(&self, role: Role, direct: DirectConfig) -> SessionConfig {
        SessionConfig {
            local_name: self.name.clone(),
            role,
            direct,
            relay: self.relay.as_ref().map(|url| RelayConfig::new(url.clone(), self.group.clone())),
            anchor_path: self.anchor_file.clone(),
            ..SessionConfig::default()
        }
    }
}

/// Logs what a headless node cannot render.
struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_opaque_blob(&self, data: &[u8], from: &PeerInfo) {
        log::info!("{} bytes of device data from {}", data.len(), from.name);
    }

    fn on_anchor(&self, anchor: &SharedAnchor) {
        let t = anchor.transform.translation();
        log::info!(
            "Anchor {} at ({:.2}, {:.2}, {:.2}), confidence {:.2}",
            anchor.id,
            t.x,
            t.y,
            t.z,
            anchor.confidence
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Relay { bind, max_members } => {
            let server = RelayServer::new(RelayServerConfig {
                bind_addr: bind,
                max_members_per_group: max_members,
                ..RelayServerConfig::default()
            });
            server.run().await
        }
        Commands::Host { node, bind, diagram } => {
            let direct = DirectConfig {
                bind_addr: bind,
                ..DirectConfig::default()
            };
            let handle = spawn(node.session_config(Role::CanOriginate, direct));
            handle.start_hosting().await?;
            for path in &diagram {
                let (filename, elements) = load_diagram(path)?;
                match handle.share_diagram(filename.clone(), elements, None).await? {
                    Some(id) => log::info!("Sharing {} as {}", filename, id),
                    None => log::warn!("{} was not shared", filename),
                }
            }
            if handle.snapshot().anchor.is_none() {
                handle.broadcast_current_anchor(1.0).await?;
            }
            run_until_ctrl_c(handle).await
        }
        Commands::Join { node, peer } => {
            let direct = DirectConfig {
                seed_peers: peer,
                ..DirectConfig::default()
            };
            let handle = spawn(node.session_config(Role::ReceiveOnly, direct));
            handle.join_session().await?;
            run_until_ctrl_c(handle).await
        }
    }
}

fn spawn(config: SessionConfig) -> SessionHandle {
    // Headless: the device sits at the world origin
    SessionBuilder::new(config)
        .pose_provider(Arc::new(StaticPoseProvider::new(Some(Matrix4::IDENTITY))))
        .observer(Arc::new(LoggingObserver))
        .spawn()
}

/// Filename is the file stem; the file holds a JSON array of elements.
fn load_diagram(path: &Path) -> Result<(String, Vec<Element>), BoxError> {
    let filename = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("no usable file name in {}", path.display()))?
        .to_string();
    let json = std::fs::read_to_string(path)?;
    let elements: Vec<Element> = serde_json::from_str(&json)?;
    Ok((filename, elements))
}

async fn run_until_ctrl_c(handle: SessionHandle) -> Result<(), BoxError> {
    let mut snapshots = handle.subscribe();
    let mut alerts = handle.alerts();
    let mut last_status = String::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.status != last_status {
                    log::info!("[{}] {}", snapshot.state, snapshot.status);
                    last_status = snapshot.status.clone();
                }
                log::debug!(
                    "{} diagrams, {} peers, relay {}",
                    snapshot.diagrams.len(),
                    snapshot.connected_peers.len(),
                    snapshot.relay_participants
                );
            }
            alert = alerts.recv() => match alert {
                Ok(alert) => log::warn!("{}: {}", alert.title(), alert),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Missed {} alerts", n);
                }
                Err(_) => break,
            },
        }
    }

    log::info!("Stopping session");
    handle.stop_session().await?;
    Ok(())
}
