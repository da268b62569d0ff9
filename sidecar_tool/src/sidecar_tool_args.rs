use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use anyhow::{ensure, Result};
use bytesize::ByteSize;
use clap::{
    error::ErrorKind, CommandFactory as _, Error as ClapError, Parser, Subcommand, ValueEnum,
};
use types::{
    config::Config,
    primitives::{Slot, H256},
};

const DEFAULT_LISTEN_ADDRESS: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9500));
const DEFAULT_MAX_DATABASE_SIZE: ByteSize = ByteSize::gib(64);

/// Inspects and serves a blob sidecar store
#[derive(Parser)]
#[clap(display_name = "sidecar_tool", verbatim_doc_comment)]
pub struct SidecarToolArgs {
    /// Name of the network to use the constants of
    #[clap(long, value_enum, default_value_t = Network::default())]
    network: Network,

    /// Load configuration from YAML_FILE instead of using the network constants
    #[clap(long, value_name = "YAML_FILE")]
    configuration_file: Option<PathBuf>,

    /// Directory of the sidecar store
    #[clap(long, value_name = "DIRECTORY", required_unless_present = "in_memory")]
    data_dir: Option<PathBuf>,

    /// Use an empty in-memory store instead of one on disk
    #[clap(long, conflicts_with = "data_dir")]
    in_memory: bool,

    /// Maximum size of the database on disk
    #[clap(long, default_value_t = DEFAULT_MAX_DATABASE_SIZE)]
    max_database_size: ByteSize,

    #[clap(subcommand)]
    command: SidecarToolCommand,
}

#[derive(Clone, Copy, Default, ValueEnum)]
#[cfg_attr(test, derive(PartialEq, Eq, Debug))]
enum Network {
    #[default]
    Mainnet,
    Minimal,
}

#[derive(Clone, Subcommand)]
#[cfg_attr(test, derive(PartialEq, Eq, Debug))]
pub enum SidecarToolCommand {
    /// Show the number of stored sidecars and the slots they cover
    /// (example: sidecar_tool --data-dir blobs info)
    Info,

    /// Print stored sidecars by slot or block root
    /// (example: sidecar_tool --data-dir blobs get --slot 100)
    Get {
        #[clap(long, value_name = "SLOT", required_unless_present = "root")]
        slot: Option<Slot>,

        #[clap(long, value_name = "BLOCK_ROOT", conflicts_with = "slot", value_parser = parse_root)]
        root: Option<H256>,
    },

    /// Serve BlobSidecarsByRange requests over TCP
    /// (example: sidecar_tool --data-dir blobs serve --listen 0.0.0.0:9500)
    Serve {
        #[clap(long, default_value_t = DEFAULT_LISTEN_ADDRESS)]
        listen: SocketAddr,

        /// Slot to measure the availability period from (defaults to the highest stored slot)
        #[clap(long, value_name = "SLOT")]
        current_slot: Option<Slot>,
    },
}

#[cfg_attr(test, derive(Debug))]
pub struct SidecarToolConfig {
    pub config: Config,
    pub storage: StorageConfig,
    pub command: SidecarToolCommand,
}

#[cfg_attr(test, derive(PartialEq, Eq, Debug))]
pub enum StorageConfig {
    InMemory,
    Persistent {
        directory: PathBuf,
        max_size: ByteSize,
    },
}

impl SidecarToolArgs {
    pub fn try_into_config(self) -> Result<SidecarToolConfig> {
        let Self {
            network,
            configuration_file,
            data_dir,
            in_memory,
            max_database_size,
            command,
        } = self;

        let config = match configuration_file {
            Some(path) => serde_yaml::from_reader(fs_err::File::open(path)?)?,
            None => match network {
                Network::Mainnet => Config::mainnet(),
                Network::Minimal => Config::minimal(),
            },
        };

        config.validate()?;

        let storage = match data_dir {
            Some(directory) => StorageConfig::Persistent {
                directory,
                max_size: max_database_size,
            },
            None => {
                ensure!(in_memory, Self::clap_error("--data-dir is required"));
                StorageConfig::InMemory
            }
        };

        Ok(SidecarToolConfig {
            config,
            storage,
            command,
        })
    }

    pub fn clap_error(message: impl core::fmt::Display) -> ClapError {
        Self::command().error(ErrorKind::ValueValidation, message)
    }
}

fn parse_root(string: &str) -> Result<H256> {
    let bytes = hex::decode(string.strip_prefix("0x").unwrap_or(string))?;

    ensure!(
        bytes.len() == H256::len_bytes(),
        "block root must be {} bytes long",
        H256::len_bytes(),
    );

    Ok(H256::from_slice(&bytes))
}
