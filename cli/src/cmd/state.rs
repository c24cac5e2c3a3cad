use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Args;
use courier::artifact;
use courier::host;
use courier::host::Host;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cmd::Run;
use crate::config;

/// Probe the artifact reference and every declared target
#[derive(Debug, Args)]
pub struct StateArgs {
    /// Deployment config file.
    #[clap(short = 'f', long = "file")]
    pub file: Utf8PathBuf,
}

impl Run for StateArgs {
    async fn run(&self) -> Result<()> {
        let config = config::load(&self.file)?;

        // A failed probe leaves the reference unobservable, which is a
        // warning, not an error.
        match artifact::probe(&config.artifact.refer).await {
            Ok(status) => println!(
                "artifact {} accessible={} digest={} type={} length={}",
                config.artifact.refer.uri,
                status.accessible,
                status.digest,
                status.content_type,
                status.length,
            ),
            Err(err) => {
                warn!(error = ?err, uri = %config.artifact.refer.uri, "artifact is unobservable");
                println!("artifact {} accessible=false", config.artifact.refer.uri);
            }
        }

        let cancel = CancellationToken::new();
        for target in &config.targets {
            let address = &target.host.host.address;

            let probed = async {
                let connected = host::connect(&target.host, cancel.child_token()).await?;
                let status = connected.state().await;
                let _ = connected.close().await;
                status
            }
            .await;

            match probed {
                Ok(status) => println!(
                    "target {address} accessible={} os={} arch={} version={}",
                    status.accessible, status.os, status.arch, status.version,
                ),
                Err(err) => {
                    warn!(error = ?err, target = %address, "target is unobservable");
                    println!("target {address} accessible=false");
                }
            }
        }

        Ok(())
    }
}
