use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use grid_sync::server::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "grid-server")]
#[command(about = "Realtime multi-user grid sync server")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "GRID_BIND_ADDR", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Grid rows
    #[arg(long, env = "GRID_ROWS", default_value_t = 10)]
    rows: u32,

    /// Grid columns
    #[arg(long, env = "GRID_COLS", default_value_t = 10)]
    cols: u32,

    /// RocksDB directory; omit to keep the grid in memory only
    #[arg(long, env = "GRID_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Send each edit back to the session that made it
    #[arg(long, env = "GRID_ECHO", default_value_t = true, action = clap::ArgAction::Set)]
    echo: bool,

    /// Frames a slow session may fall behind before it starts dropping them
    #[arg(long, env = "GRID_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between retries of failed cell writes (0 disables)
    #[arg(long, env = "GRID_RECONCILE_SECS", default_value_t = 30)]
    reconcile_secs: u64,
}

impl Args {
    fn server_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            rows: self.rows,
            cols: self.cols,
            broadcast_capacity: self.broadcast_capacity,
            echo_to_sender: self.echo,
            storage_path: self.db_path,
            reconcile_interval_secs: self.reconcile_secs,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.rows == 0 || args.cols == 0 {
        log::error!("Grid must have at least one row and one column");
        return ExitCode::FAILURE;
    }

    let config = args.server_config();
    match &config.storage_path {
        Some(path) => log::info!(
            "Starting {}x{} grid with storage at {}",
            config.rows,
            config.cols,
            path.display()
        ),
        None => log::warn!(
            "Starting {}x{} grid without storage; edits are lost on exit",
            config.rows,
            config.cols
        ),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to open grid storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let config = Args::try_parse_from(["grid-server"]).unwrap().server_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!((config.rows, config.cols), (defaults.rows, defaults.cols));
        assert_eq!(config.echo_to_sender, defaults.echo_to_sender);
        assert_eq!(config.reconcile_interval_secs, defaults.reconcile_interval_secs);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_flags_override() {
        let config = Args::try_parse_from([
            "grid-server",
            "--rows",
            "50",
            "--cols",
            "26",
            "--echo",
            "false",
            "--db-path",
            "/tmp/grid",
        ])
        .unwrap()
        .server_config();
        assert_eq!((config.rows, config.cols), (50, 26));
        assert!(!config.echo_to_sender);
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/grid")));
    }
}
