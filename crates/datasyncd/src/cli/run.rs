use std::sync::Arc;

use clap::{Parser, ValueEnum};
use eyre::{Result as EyreResult, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::info;

use datasync_config::load_from_dir;
use datasync_node::external::{RedundancyProps, StaticExternalData};
use datasync_node::transfer::RsyncTransfer;
use datasync_node::SyncEngine;
use datasync_primitives::BmcRole;

use super::RootArgs;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RoleArg {
    Active,
    Passive,
}

impl From<RoleArg> for BmcRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Active => Self::Active,
            RoleArg::Passive => Self::Passive,
        }
    }
}

/// Run the synchronization daemon
#[derive(Debug, Parser)]
pub struct RunCommand {
    /// Role of the local controller within the redundancy pair
    #[arg(long, value_enum)]
    pub role: RoleArg,

    /// Whether the redundancy pair is enabled
    #[arg(long, value_name = "BOOL", default_value_t = true)]
    #[arg(action = clap::ArgAction::Set)]
    pub redundancy: bool,

    /// Sibling host for destination paths; destinations stay on the local
    /// filesystem when absent
    #[arg(long, value_name = "HOST")]
    pub sibling_host: Option<String>,

    /// Remote shell handed to the transfer tool, e.g. "ssh -i /path/key"
    #[arg(long, value_name = "SHELL")]
    pub remote_shell: Option<String>,
}

impl RunCommand {
    pub async fn run(self, root_args: RootArgs) -> EyreResult<()> {
        let entries = load_from_dir(root_args.config.as_std_path())
            .wrap_err("failed to load the sync configuration")?;
        info!(count = entries.len(), config = %root_args.config, "loaded sync entries");

        let external = Arc::new(StaticExternalData::new(RedundancyProps {
            role: self.role.into(),
            redundancy_enabled: self.redundancy,
        }));

        let transfer = Arc::new(RsyncTransfer {
            destination_prefix: self.sibling_host.map(|host| format!("{host}:")),
            remote_shell: self.remote_shell,
        });

        let token = CancellationToken::new();
        let (engine, _control) = SyncEngine::new(entries, transfer, external, None, token.clone());

        let shutdown = token.clone();
        drop(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        }));

        engine.run().await
    }
}
