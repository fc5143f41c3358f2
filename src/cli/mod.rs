//! Command-line interface for ovaleval

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

mod download;
mod init;
mod serve;
mod sync;

#[derive(Subcommand)]
pub enum Commands {
    /// Start the vulnerability evaluation HTTP server
    Serve {
        /// Path to the sqlite database file
        #[arg(short, long, env = "OVALEVAL_DATABASE", default_value = "database.sqlite")]
        database: PathBuf,

        /// Port to listen on
        #[arg(short, long, env = "OVALEVAL_PORT", default_value_t = 8000)]
        port: u16,
    },

    /// Download CPE and OVAL metadata from the vendor
    Download {
        /// Directory for downloaded metadata
        #[arg(short, long, env = "OVALEVAL_METADATA_DIR", default_value = "metadata")]
        metadata_dir: PathBuf,
    },

    /// Initialize the database schema
    #[command(name = "init-db")]
    InitDb {
        /// Path to the sqlite database file
        #[arg(short, long, env = "OVALEVAL_DATABASE", default_value = "database.sqlite")]
        database: PathBuf,

        /// Initialize only the empty schema and finish
        #[arg(short, long)]
        schema_only: bool,

        /// Directory containing downloaded metadata
        #[arg(short, long, env = "OVALEVAL_METADATA_DIR", default_value = "metadata")]
        metadata_dir: PathBuf,
    },

    /// Parse downloaded metadata and populate the database
    Sync {
        /// Path to the sqlite database file
        #[arg(short, long, env = "OVALEVAL_DATABASE", default_value = "database.sqlite")]
        database: PathBuf,

        /// Directory containing downloaded metadata
        #[arg(short, long, env = "OVALEVAL_METADATA_DIR", default_value = "metadata")]
        metadata_dir: PathBuf,

        /// Re-import streams even when their timestamps are unchanged
        #[arg(long)]
        force: bool,
    },
}

/// Execute a CLI command
pub fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { database, port } => serve::run(&database, port),
        Commands::Download { metadata_dir } => download::run(&metadata_dir),
        Commands::InitDb {
            database,
            schema_only,
            metadata_dir,
        } => init::run(&database, schema_only, &metadata_dir),
        Commands::Sync {
            database,
            metadata_dir,
            force,
        } => sync::run(&database, &metadata_dir, force),
    }
}
