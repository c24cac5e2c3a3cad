use anyhow::ensure;
use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Args;
use courier::deploy;
use courier::deploy::Deployment;
use courier::runtime;
use courier::util;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cmd::Run;
use crate::config;
use crate::config::DeploymentConfig;

/// Create or update the deployment declared in a config file
#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Deployment config file.
    #[clap(short = 'f', long = "file")]
    pub file: Utf8PathBuf,
}

impl Run for ApplyArgs {
    async fn run(&self) -> Result<()> {
        let config = config::load(&self.file)?;
        let state = config::load_state(&self.file)?;

        let source = config.runtime.source().await?;
        validate_runtime(&config, &source)?;

        let timeout = if state.is_some() {
            config.timeouts.update()?
        } else {
            config.timeouts.create()?
        };

        let id = state.as_ref().map_or_else(
            || util::id::sum(&[&config.artifact.refer.uri, &util::id::hex(64)]),
            |state| state.id.clone(),
        );
        info!(%id, "applying deployment");

        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(
            timeout,
            apply(&config, state.as_ref(), &source, &id, &cancel),
        )
        .await;

        match result {
            Ok(result) => result?,
            Err(_elapsed) => {
                // Give in-flight sessions a chance to kill their remote
                // processes before reporting.
                cancel.cancel();
                anyhow::bail!("deployment timed out");
            }
        }

        config::save_state(
            &self.file,
            &config::State {
                id,
                artifact: config.artifact.clone(),
                targets: config.targets.clone(),
            },
        )
    }
}

async fn apply(
    config: &DeploymentConfig,
    state: Option<&config::State>,
    source: &runtime::Source,
    id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    // Targets dropped from the declared set are released first.
    let stale = config::stale_targets(state, config);
    if !stale.is_empty() {
        info!(count = stale.len(), "releasing removed targets");

        let targets =
            deploy::connect_targets(&stale, &config.runtime.class, cancel).await?;
        let releasing = Deployment::new(
            id.to_string(),
            targets,
            runtime::Source::local(source.root().to_path_buf())?,
            state
                .map(|state| state.artifact.clone())
                .unwrap_or_else(|| config.artifact.clone()),
            config.strategy,
            cancel.clone(),
        );

        let released = releasing.release().await;
        releasing.close().await;
        released?;
    }

    let targets =
        deploy::connect_targets(&config.targets, &config.runtime.class, cancel).await?;
    let deployment = Deployment::new(
        id.to_string(),
        targets,
        runtime::Source::local(source.root().to_path_buf())?,
        config.artifact.clone(),
        config.strategy,
        cancel.clone(),
    );

    let applied = deployment
        .apply(state.map(|state| &state.artifact))
        .await;
    deployment.close().await;
    applied
}

fn validate_runtime(config: &DeploymentConfig, source: &runtime::Source) -> Result<()> {
    let classes = runtime::classes(source)?;
    ensure!(
        classes.has(&config.runtime.class),
        "runtime source has no class {}",
        config.runtime.class
    );

    for target in &config.targets {
        ensure!(
            classes.has_os(&config.runtime.class, &target.os),
            "runtime class {} does not support os {} declared for {}",
            config.runtime.class,
            target.os,
            target.host.host.address
        );
    }

    Ok(())
}
