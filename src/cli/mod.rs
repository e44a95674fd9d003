use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::peer::PeerId;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "peershare")]
#[command(about = "A peer in a closed-membership file sharing swarm", long_about = None)]
pub struct Cli {
    /// Roster id of this peer, as listed in PeerInfo.cfg
    peer_id: PeerId,

    /// Directory holding Common.cfg, PeerInfo.cfg and the peer_<id> folders
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        let config = Config::load(&self.workdir).await?;
        info!(
            "Peer {}: {} ({} bytes in pieces of {}), {} peers in roster",
            self.peer_id,
            config.common.file_name,
            config.common.file_size,
            config.common.piece_size,
            config.roster.len()
        );

        let coordinator = Coordinator::new(config, self.peer_id, &self.workdir)?;
        coordinator.run().await
    }
}
