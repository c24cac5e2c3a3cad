//! Deployment rollout engine: sequences setup/start/stop/cleanup across a
//! target fleet with parallel fan-out, recreate or rolling strategies and
//! target-set diffing.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::warn;

use crate::host;
use crate::host::AuthnKind;
use crate::host::Host;
use crate::host::HostImpl;
use crate::host::HostOptions;
use crate::runtime;
use crate::Error;

const RUNTIME_DIR: &str = "/var/local/courier/runtime";
const ARTIFACT_DIR: &str = "/var/local/courier/artifact";

const DEFAULT_MAX_SURGE: f64 = 0.3;
const MIN_MAX_SURGE: f64 = 0.1;

// Specs ----------------------------------------------------------------------

/// One declared deployment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub host: HostOptions,
    pub os: String,
    pub arch: String,
}

/// The artifact to deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub refer: ReferSpec,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub digest: String,
}

/// Reference to pull the artifact from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferSpec {
    pub uri: String,
    #[serde(default)]
    pub authn: Option<ReferAuthn>,
    #[serde(default)]
    pub insecure: bool,
}

/// Authentication for pulling the artifact, `basic` or `bearer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferAuthn {
    #[serde(rename = "type")]
    pub kind: AuthnKind,
    #[serde(default)]
    pub user: String,
    pub secret: String,
}

/// Rollout strategy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(rename = "type", default)]
    pub kind: StrategyKind,
    #[serde(default)]
    pub rolling: Option<RollingStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Recreate,
    Rolling,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RollingStrategy {
    /// Maximum fraction of targets deployed at once, within [0.1, 1.0].
    #[serde(default = "default_max_surge")]
    pub max_surge: f64,
}

fn default_max_surge() -> f64 {
    DEFAULT_MAX_SURGE
}

// Deployment -----------------------------------------------------------------

/// A declared target bound to a live host connection.
pub struct DeploymentTarget<H = HostImpl> {
    pub host: H,
    pub address: String,
    pub runtime_class: String,
    pub os: String,
    pub arch: String,
}

impl<H> DeploymentTarget<H> {
    /// Deterministic path of the per-target service script.
    #[must_use]
    pub fn service_command(&self) -> String {
        let suffix = if self.os == "windows" { "ps1" } else { "sh" };
        format!(
            "{RUNTIME_DIR}/{}/{}/service.{suffix}",
            self.runtime_class, self.os
        )
    }
}

/// One deployment operation over a resolved target fleet. Created fresh on
/// every apply cycle; only the identifier survives between cycles.
pub struct Deployment<H = HostImpl> {
    pub id: String,
    targets: Vec<DeploymentTarget<H>>,
    runtime: runtime::Source,
    artifact: ArtifactSpec,
    strategy: Strategy,
    cancel: CancellationToken,
}

/// Connects every declared target, tearing down already-opened hosts when
/// a later one fails.
pub async fn connect_targets(
    specs: &[TargetSpec],
    runtime_class: &str,
    cancel: &CancellationToken,
) -> Result<Vec<DeploymentTarget>> {
    let mut targets: Vec<DeploymentTarget> = Vec::with_capacity(specs.len());

    for spec in specs {
        match host::connect(&spec.host, cancel.child_token()).await {
            Ok(host) => targets.push(DeploymentTarget {
                host,
                address: spec.host.host.address.clone(),
                runtime_class: runtime_class.to_string(),
                os: spec.os.clone(),
                arch: spec.arch.clone(),
            }),
            Err(err) => {
                for target in &targets {
                    let _ = target.host.close().await;
                }
                return Err(
                    err.context(format!("cannot connect target {}", spec.host.host.address))
                );
            }
        }
    }

    Ok(targets)
}

impl<H> Deployment<H>
where
    H: Host + Send + Sync,
{
    pub fn new(
        id: String,
        targets: Vec<DeploymentTarget<H>>,
        runtime: runtime::Source,
        artifact: ArtifactSpec,
        strategy: Strategy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            targets,
            runtime,
            artifact,
            strategy,
            cancel,
        }
    }

    /// Applies the deployment: setup on every target, then start, stopping
    /// first where the artifact identity changed since the previous apply.
    /// Rolling strategies process the fleet in ordered sequential batches.
    pub async fn apply(&self, prev_artifact: Option<&ArtifactSpec>) -> Result<()> {
        self.setup().await?;

        let changed = artifact_changed(prev_artifact, &self.artifact);

        if self.strategy.kind == StrategyKind::Rolling {
            let max_surge = self
                .strategy
                .rolling
                .map_or(DEFAULT_MAX_SURGE, |rolling| rolling.max_surge);
            let batches = rolling_batches(max_surge, self.targets.len());

            // A batch covering the whole fleet degenerates to recreate.
            if batches.len() > 1 {
                for range in batches {
                    let batch = &self.targets[range];
                    if changed {
                        self.run_verb(batch, "stop", &[]).await?;
                    }
                    self.run_verb(batch, "start", &[]).await?;
                }
                return Ok(());
            }
        }

        if changed {
            self.run_verb(&self.targets, "stop", &[]).await?;
        }
        self.run_verb(&self.targets, "start", &[]).await
    }

    /// Tears the deployment down on every target.
    pub async fn release(&self) -> Result<()> {
        self.run_verb(&self.targets, "cleanup", &[]).await
    }

    /// Closes every target host and its proxy chain.
    pub async fn close(&self) {
        for target in &self.targets {
            if let Err(err) = target.host.close().await {
                warn!(target = %target.address, error = ?err, "failed to close host");
            }
        }
    }

    async fn setup(&self) -> Result<()> {
        // Upload the runtime bundle, then mark the Linux service script
        // executable.
        let runtime_root = self.runtime.root();
        self.fan_out(&self.targets, |target| async move {
            // TODO: skip the upload when the bundle already exists remotely.
            target
                .host
                .upload_directory(runtime_root, RUNTIME_DIR)
                .await
                .with_context(|| format!("cannot upload runtime to {}", target.address))?;

            if target.os == "linux" {
                let script = format!(
                    "{RUNTIME_DIR}/{}/linux/service.sh",
                    target.runtime_class
                );
                target
                    .host
                    .execute_with_output("chmod", &["a+x", &script])
                    .await
                    .with_context(|| {
                        format!("cannot change service permission on {}", target.address)
                    })?;
            }

            Ok(())
        })
        .await
        .context("cannot upload runtime")?;

        // Stage the artifact descriptor locally, then upload it.
        let staged = stage_artifact(&self.artifact)?;
        let staged_root = Utf8Path::from_path(staged.path())
            .context("staging directory path is not UTF-8")?;
        let artifact_dir = format!("{ARTIFACT_DIR}/{}", self.id);

        self.fan_out(&self.targets, |target| {
            let artifact_dir = artifact_dir.as_str();
            async move {
                target
                    .host
                    .upload_directory(staged_root, artifact_dir)
                    .await
                    .with_context(|| format!("cannot upload artifact to {}", target.address))
            }
        })
        .await
        .context("cannot upload artifact")?;

        drop(staged);

        // setup <id> <uri> <digest> [authnType user secret]
        let mut extra = vec![
            self.artifact.refer.uri.clone(),
            self.artifact.digest.clone(),
        ];
        if let Some(authn) = &self.artifact.refer.authn {
            extra.push(authn.kind.to_string());
            extra.push(authn.user.clone());
            extra.push(authn.secret.clone());
        }

        self.run_verb(&self.targets, "setup", &extra).await
    }

    /// Runs `<service script> <verb> <id> [extra...]` on every listed
    /// target in parallel.
    async fn run_verb(
        &self,
        targets: &[DeploymentTarget<H>],
        verb: &str,
        extra: &[String],
    ) -> Result<()> {
        self.fan_out(targets, |target| async move {
            let command = target.service_command();
            let mut args: Vec<&str> = Vec::with_capacity(extra.len() + 2);
            args.push(verb);
            args.push(&self.id);
            args.extend(extra.iter().map(String::as_str));

            target
                .host
                .execute_with_output(&command, &args)
                .await
                .map(drop)
                .with_context(|| format!("cannot execute {verb} on {}", target.address))
        })
        .await
        .with_context(|| format!("cannot execute {verb}"))
    }

    /// Runs one task per target concurrently. The first failure cancels
    /// the deployment token so in-flight siblings stop promptly; sibling
    /// errors are logged, not aggregated, and the first error is returned.
    async fn fan_out<'t, F, Fut>(&self, targets: &'t [DeploymentTarget<H>], task: F) -> Result<()>
    where
        F: Fn(&'t DeploymentTarget<H>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut tasks: FuturesUnordered<_> = targets.iter().map(task).collect();

        let mut first: Option<anyhow::Error> = None;
        while let Some(result) = tasks.next().await {
            let Err(err) = result else {
                continue;
            };

            if first.is_none() {
                self.cancel.cancel();
                first = Some(err);
            } else if matches!(err.downcast_ref::<Error>(), Some(Error::Canceled)) {
                // Canceled because the first failure tore the phase down;
                // not authoritative for that target.
            } else {
                error!(error = ?err, "sibling task failed");
            }
        }

        first.map_or(Ok(()), Err)
    }
}

// Rollout math and diffing ---------------------------------------------------

/// Batch index ranges for a rolling rollout. The batch size is
/// `max(1, round(max_surge × count))`; `max_surge` below 0.1 re-defaults
/// to 0.3. The ranges partition `0..count` in declared order.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn rolling_batches(max_surge: f64, count: usize) -> Vec<Range<usize>> {
    let max_surge = if max_surge < MIN_MAX_SURGE {
        DEFAULT_MAX_SURGE
    } else {
        max_surge
    };

    let step = ((max_surge * count as f64).round() as usize).max(1);

    let mut batches = Vec::with_capacity(count.div_ceil(step));
    let mut start = 0;
    while start < count {
        let end = (start + step).min(count);
        batches.push(start..end);
        start = end;
    }

    batches
}

/// Whether the artifact identity changed since the previous apply. Only
/// the reference URI participates; with no previous artifact the answer
/// is always "changed".
#[must_use]
pub fn artifact_changed(prev: Option<&ArtifactSpec>, next: &ArtifactSpec) -> bool {
    prev.is_none_or(|prev| prev.refer.uri != next.refer.uri)
}

/// Whether the declared target membership changed, compared by address.
#[must_use]
pub fn targets_changed(old: &[TargetSpec], new: &[TargetSpec]) -> bool {
    if old.len() != new.len() {
        return true;
    }

    let mut old_addresses: Vec<&str> = old.iter().map(|t| t.host.host.address.as_str()).collect();
    let mut new_addresses: Vec<&str> = new.iter().map(|t| t.host.host.address.as_str()).collect();
    old_addresses.sort_unstable();
    new_addresses.sort_unstable();

    old_addresses != new_addresses
}

/// Targets present in the old set but absent from the new one, by address;
/// these are released before the new set is applied.
#[must_use]
pub fn removed_targets(old: &[TargetSpec], new: &[TargetSpec]) -> Vec<TargetSpec> {
    let kept: std::collections::BTreeSet<&str> =
        new.iter().map(|t| t.host.host.address.as_str()).collect();

    old.iter()
        .filter(|t| !kept.contains(t.host.host.address.as_str()))
        .cloned()
        .collect()
}

/// Writes the artifact descriptor into a staging directory: `command`,
/// `ports` (ascending), `envs` (`KEY=VALUE`, lexicographic) and `volumes`
/// (lexicographic), one value per line.
fn stage_artifact(artifact: &ArtifactSpec) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("courier-")
        .tempdir()
        .context("cannot create staging directory")?;

    std::fs::write(dir.path().join("command"), &artifact.command)
        .context("cannot prepare command")?;

    let mut ports = artifact.ports.clone();
    ports.sort_unstable();
    let ports: String = ports.iter().map(|port| format!("{port}\n")).collect();
    std::fs::write(dir.path().join("ports"), ports).context("cannot prepare ports")?;

    let envs: String = artifact
        .envs
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect();
    std::fs::write(dir.path().join("envs"), envs).context("cannot prepare envs")?;

    let mut volumes = artifact.volumes.clone();
    volumes.sort_unstable();
    let volumes: String = volumes.iter().map(|volume| format!("{volume}\n")).collect();
    std::fs::write(dir.path().join("volumes"), volumes).context("cannot prepare volumes")?;

    Ok(dir)
}
