//! Issue a bearer token for a murmur user.
//!
//! Registers (or renames) the user in the server's database, then prints a
//! token signed with the server's secret.
//!
//! Usage:
//!   MURMUR_TOKEN_SECRET=... \
//!     cargo run --bin murmur-token -- --db-path murmur.db --id u1 --name Ada

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use murmur_server::auth::TokenVerifier;
use murmur_server::config::DEV_TOKEN_SECRET;
use murmur_server::protocol::Identity;
use murmur_server::store::{MessageStore, SqliteStore};

#[derive(Parser)]
#[command(name = "murmur-token", about = "Register a user and print a signed token")]
struct Args {
    /// SQLite database shared with the server.
    #[arg(long, env = "MURMUR_DB_PATH")]
    db_path: String,

    /// Stable user id (token subject).
    #[arg(long)]
    id: String,

    /// Display name stored in the directory.
    #[arg(long)]
    name: String,

    /// Token lifetime in hours.
    #[arg(long, default_value_t = 24)]
    ttl_hours: i64,

    /// HMAC secret; must match the server's.
    #[arg(long, env = "MURMUR_TOKEN_SECRET", default_value = DEV_TOKEN_SECRET, hide_env_values = true)]
    token_secret: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    if args.token_secret == DEV_TOKEN_SECRET {
        tracing::warn!("Signing with the built-in development secret");
    }

    let store = Arc::new(
        SqliteStore::open(&args.db_path)
            .with_context(|| format!("Failed to open database {}", args.db_path))?,
    );
    let identity = Identity::new(&args.id, &args.name);
    store
        .upsert_identity(&identity)
        .context("Failed to register user")?;
    tracing::info!(user = %identity.id, name = %identity.display_name, "User registered");

    let issuer = TokenVerifier::new(args.token_secret.as_bytes(), store)?;
    println!("{}", issuer.issue(&identity.id, chrono::Duration::hours(args.ttl_hours)));
    Ok(())
}
