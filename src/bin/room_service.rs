//! Manifold Studio room service: hosts the CRDT room actors over HTTP and
//! WebSocket (§4.4, §6).

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use manifold_studio_core::config::ServiceConfig;
use manifold_studio_core::error::StudioResult;
use manifold_studio_core::room::service::RoomRegistry;
use manifold_studio_core::room::storage::Storage;
use manifold_studio_core::room::{router, AppState};

#[derive(Debug, Parser)]
#[command(name = "room-service", version = manifold_studio_core::VERSION)]
struct Cli {
    /// Address to listen on, overriding MANIFOLD_LISTEN / the default.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Path to the SQLite database backing all rooms.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Delay before a dirty room compacts its WAL, in milliseconds.
    #[arg(long)]
    compaction_delay_ms: Option<u64>,
}

impl Cli {
    fn apply(self, mut config: ServiceConfig) -> ServiceConfig {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(db_path) = self.db_path {
            config.db_path = db_path;
        }
        if let Some(delay) = self.compaction_delay_ms {
            config.compaction_delay_ms = delay;
        }
        config
    }
}

#[tokio::main]
async fn main() -> StudioResult<()> {
    tracing_subscriber::fmt().with_env_filter("manifold_studio_core=info,room_service=info").init();

    let cli = Cli::parse();
    let config = cli.apply(ServiceConfig::load()?);

    info!(version = manifold_studio_core::VERSION, listen = %config.listen, db_path = %config.db_path.display(), "starting room service");

    let storage = Storage::connect(&config.db_path).await?;
    let rooms = RoomRegistry::with_compaction_delay(storage, config.compaction_delay());
    let app = router(AppState { rooms });

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(addr = %config.listen, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
