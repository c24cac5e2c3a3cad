use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Args;
use courier::deploy;
use courier::deploy::Deployment;
use courier::runtime;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cmd::Run;
use crate::config;

/// Tear the deployment down on every target
#[derive(Debug, Args)]
pub struct ReleaseArgs {
    /// Deployment config file.
    #[clap(short = 'f', long = "file")]
    pub file: Utf8PathBuf,
}

impl Run for ReleaseArgs {
    async fn run(&self) -> Result<()> {
        let config = config::load(&self.file)?;
        let state = config::load_state(&self.file)?;

        let Some(state) = state else {
            info!("nothing to release");
            return Ok(());
        };

        let source = config.runtime.source().await?;
        let timeout = config.timeouts.delete()?;
        let cancel = CancellationToken::new();

        let result = tokio::time::timeout(timeout, async {
            // The stored targets are authoritative: they are the hosts the
            // deployment actually went to.
            let targets =
                deploy::connect_targets(&state.targets, &config.runtime.class, &cancel).await?;
            let releasing = Deployment::new(
                state.id.clone(),
                targets,
                runtime::Source::local(source.root().to_path_buf())?,
                state.artifact.clone(),
                config.strategy,
                cancel.clone(),
            );

            let released = releasing.release().await;
            releasing.close().await;
            released
        })
        .await;

        match result {
            Ok(result) => result?,
            Err(_elapsed) => {
                cancel.cancel();
                anyhow::bail!("release timed out");
            }
        }

        config::remove_state(&self.file)
    }
}
