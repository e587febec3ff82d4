use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use const_format::concatcp;
use eyre::Result as EyreResult;

mod run;

use run::RunCommand;

pub const EXAMPLES: &str = r"
  # Run as the active controller against a remote sibling
  $ datasyncd run --role active --sibling-host 169.254.0.2

  # Run with a custom configuration directory
  $ datasyncd --config data/sync.d run --role passive
";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(after_help = concatcp!(
    "Environment variables:\n",
    "  DATASYNC_CONFIG    Directory holding the sync-entry descriptors\n\n",
    "Examples:",
    EXAMPLES
))]
pub struct RootCommand {
    #[command(flatten)]
    pub args: RootArgs,

    #[command(subcommand)]
    pub action: SubCommands,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
    #[command(alias = "up")]
    Run(RunCommand),
}

#[derive(Debug, Parser)]
pub struct RootArgs {
    /// Directory holding the sync-entry JSON descriptors
    #[arg(long, value_name = "PATH", default_value = "/etc/datasync")]
    #[arg(env = "DATASYNC_CONFIG", hide_env_values = true)]
    pub config: Utf8PathBuf,
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<()> {
        match self.action {
            SubCommands::Run(run) => run.run(self.args).await,
        }
    }
}
