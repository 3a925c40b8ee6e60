//! Command-line surface for the node binary. Node-lifecycle knobs (timeouts, rate
//! limits, tunnel capacity, ...) live in [`storj_config::StorjConfig`] and are loaded
//! through `--config-file`/`--dump-config`; the flags here are process-level (where to
//! bind, where to persist shards, which identity to run as) and have no place in a
//! checked-in config schema.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum StorageBackend {
    Memory,
    Filesystem,
    Embedded,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum NodeRole {
    Renter,
    Farmer,
    Both,
}

#[derive(Parser, Debug)]
#[command(name = "storj-node", about = "Peer-to-peer distributed storage network node")]
pub struct NodeArgs {
    /// JSON schema produced by `--dump-config`, loaded and layered with CLI/env
    /// overrides (§9 "Global-ish constants" -> a single `Config` value).
    #[arg(long, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Write the default config schema to this path and exit, instead of starting a
    /// node.
    #[arg(long, value_name = "PATH")]
    pub dump_config: Option<PathBuf>,

    /// Address this node binds its RPC listener to.
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_address: String,

    /// Port this node binds its RPC listener to.
    #[arg(long, default_value = "4000")]
    pub listen_port: u16,

    /// Port the data channel listener binds to. Defaults to `listen_port + 1`.
    #[arg(long)]
    pub data_channel_port: Option<u16>,

    /// The address/port advertised to peers, if different from the bind address (e.g.
    /// behind a port-forward). Defaults to `listen_address`/`listen_port`.
    #[arg(long)]
    pub public_address: Option<String>,
    #[arg(long)]
    pub public_port: Option<u16>,

    /// 32-byte hex-encoded secp256k1 scalar. Key-ring persistence and encryption are
    /// out of scope (§1) — supply a raw key here, or omit it to run with a freshly
    /// generated, ephemeral identity.
    #[arg(long)]
    pub node_key_hex: Option<String>,

    #[arg(long, value_enum, default_value = "memory")]
    pub storage_backend: StorageBackend,

    /// Root directory for the filesystem/embedded storage backends.
    #[arg(long, default_value = "./storj-data")]
    pub storage_dir: PathBuf,

    /// Total shard storage cap, in bytes.
    #[arg(long, default_value = "10737418240")]
    pub storage_capacity_bytes: u64,

    #[arg(long, value_enum, default_value = "both")]
    pub role: NodeRole,
}
