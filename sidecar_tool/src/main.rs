use std::{process::ExitCode, sync::Arc};

use anyhow::Result;
use clap::{Error as ClapError, Parser as _};
use database::{Database, DatabaseMode};
use log::{error, info};
use prometheus_metrics::{Metrics, METRICS};
use sidecar_store::{SidecarStore, StoreOccupancy};
use types::containers::BlobSidecar;

use crate::sidecar_tool_args::{
    SidecarToolArgs, SidecarToolCommand, SidecarToolConfig, StorageConfig,
};

mod serve;
mod sidecar_tool_args;

const DATABASE_NAME: &str = "blob_sidecars";

fn main() -> ExitCode {
    if let Err(error) = try_main() {
        error.downcast_ref().map(ClapError::exit);
        error!("{error:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn try_main() -> Result<()> {
    binary_utils::initialize_logger(module_path!(), false)?;

    let SidecarToolConfig {
        config,
        storage,
        command,
    } = SidecarToolArgs::try_parse()?.try_into_config()?;

    info!("using {} configuration", config.config_name);

    let database_mode = match command {
        SidecarToolCommand::Info | SidecarToolCommand::Get { .. } => DatabaseMode::ReadOnly,
        SidecarToolCommand::Serve { .. } => DatabaseMode::ReadWrite,
    };

    let database = match storage {
        StorageConfig::InMemory => Database::in_memory(),
        StorageConfig::Persistent {
            directory,
            max_size,
        } => Database::persistent(DATABASE_NAME, directory, max_size, database_mode)?,
    };

    let metrics = Arc::new(Metrics::new()?);
    metrics.register_with_default_metrics()?;
    METRICS.get_or_init(|| Arc::clone(&metrics));

    let config = Arc::new(config);
    let store = Arc::new(SidecarStore::new(database, &config, Some(Arc::clone(&metrics)))?);

    match command {
        SidecarToolCommand::Info => print_info(&store),
        SidecarToolCommand::Get { slot, root } => {
            let blob_sidecars = match (slot, root) {
                (Some(slot), _) => store.get_by_slot(slot)?,
                (None, Some(root)) => store.get_by_root(root)?.into_iter().collect(),
                (None, None) => vec![],
            };

            print_sidecars(&blob_sidecars);

            Ok(())
        }
        SidecarToolCommand::Serve {
            listen,
            current_slot,
        } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(serve::run(config, store, metrics, listen, current_slot)),
    }
}

#[expect(clippy::print_stdout, reason = "printing is the purpose of the subcommand")]
fn print_info(store: &SidecarStore) -> Result<()> {
    let StoreOccupancy {
        sidecars,
        lowest_slot,
        highest_slot,
    } = store.occupancy()?;

    println!("retention window: {} slots", store.retention_window());
    println!("stored sidecars:  {sidecars}");

    if let (Some(lowest_slot), Some(highest_slot)) = (lowest_slot, highest_slot) {
        println!("slots:            {lowest_slot}..={highest_slot}");
    }

    Ok(())
}

#[expect(clippy::print_stdout, reason = "printing is the purpose of the subcommand")]
fn print_sidecars(blob_sidecars: &[Arc<BlobSidecar>]) {
    if blob_sidecars.is_empty() {
        println!("no blob sidecars found");
    }

    for blob_sidecar in blob_sidecars {
        println!(
            "slot: {}, block_root: {:?}, blobs: {}",
            blob_sidecar.slot,
            blob_sidecar.block_root,
            blob_sidecar.blobs.len(),
        );

        for (index, commitment) in blob_sidecar.kzg_commitments().enumerate() {
            println!("  commitment {index}: {commitment:?}");
        }
    }
}
