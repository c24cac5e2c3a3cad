use std::time::Duration;

use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use courier::deploy;
use courier::deploy::ArtifactSpec;
use courier::deploy::Strategy;
use courier::deploy::TargetSpec;
use courier::runtime;
use courier::runtime::ExternalAuthn;
use serde::Deserialize;
use serde::Serialize;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Declarative deployment config, one TOML file per deployment.
#[derive(Debug, Deserialize)]
pub struct DeploymentConfig {
    pub targets: Vec<TargetSpec>,
    pub artifact: ArtifactSpec,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime class to deploy, one of the source's top-level entries.
    pub class: String,
    /// Local directory or git URL holding the runtime bundle.
    pub source: String,
    #[serde(default)]
    pub authn: Option<ExternalAuthn>,
    #[serde(default)]
    pub insecure: bool,
}

/// Operation timeouts as humantime strings, e.g. `"10m"`.
#[derive(Debug, Default, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default)]
    pub create: Option<String>,
    #[serde(default)]
    pub update: Option<String>,
    #[serde(default)]
    pub delete: Option<String>,
}

impl TimeoutsConfig {
    pub fn create(&self) -> Result<Duration> {
        parse_timeout(self.create.as_deref())
    }

    pub fn update(&self) -> Result<Duration> {
        parse_timeout(self.update.as_deref())
    }

    pub fn delete(&self) -> Result<Duration> {
        parse_timeout(self.delete.as_deref())
    }
}

fn parse_timeout(text: Option<&str>) -> Result<Duration> {
    match text {
        None => Ok(DEFAULT_TIMEOUT),
        Some(text) => {
            humantime::parse_duration(text).with_context(|| format!("invalid timeout {text}"))
        }
    }
}

pub fn load(path: &Utf8Path) -> Result<DeploymentConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {path}"))?;
    let config: DeploymentConfig =
        toml::from_str(&text).with_context(|| format!("cannot parse config {path}"))?;

    ensure!(!config.targets.is_empty(), "config declares no targets");
    ensure!(!config.runtime.class.is_empty(), "config declares no runtime class");
    ensure!(!config.runtime.source.is_empty(), "config declares no runtime source");
    ensure!(!config.artifact.refer.uri.is_empty(), "config declares no artifact uri");

    Ok(config)
}

impl RuntimeConfig {
    /// Materializes the runtime source: git URLs are cloned, anything else
    /// is a local directory.
    pub async fn source(&self) -> Result<runtime::Source> {
        if self.source.starts_with("http://")
            || self.source.starts_with("https://")
            || self.source.starts_with("git://")
        {
            return runtime::external(runtime::ExternalOptions {
                source: self.source.clone(),
                authn: self.authn.clone(),
                insecure: self.insecure,
            })
            .await;
        }

        runtime::Source::local(Utf8PathBuf::from(&self.source))
    }
}

// State ----------------------------------------------------------------------

/// What the previous apply left behind; enables update diffing across
/// invocations.
#[derive(Debug, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub artifact: ArtifactSpec,
    pub targets: Vec<TargetSpec>,
}

pub fn state_path(config_path: &Utf8Path) -> Utf8PathBuf {
    let mut path = config_path.to_path_buf();
    path.set_extension("state.json");
    path
}

pub fn load_state(config_path: &Utf8Path) -> Result<Option<State>> {
    let path = state_path(config_path);
    if !path.exists() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read state {path}"))?;
    let state = serde_json::from_str(&text)
        .with_context(|| format!("cannot parse state {path}"))?;
    Ok(Some(state))
}

pub fn save_state(config_path: &Utf8Path, state: &State) -> Result<()> {
    let path = state_path(config_path);
    let text = serde_json::to_string_pretty(state).context("cannot serialize state")?;
    std::fs::write(&path, text).with_context(|| format!("cannot write state {path}"))
}

pub fn remove_state(config_path: &Utf8Path) -> Result<()> {
    let path = state_path(config_path);
    if path.exists() {
        std::fs::remove_file(&path).with_context(|| format!("cannot remove state {path}"))?;
    }
    Ok(())
}

/// Targets that should be released before applying: present in the stored
/// state, absent from the declared config.
pub fn stale_targets(state: Option<&State>, config: &DeploymentConfig) -> Vec<TargetSpec> {
    match state {
        Some(state) => deploy::removed_targets(&state.targets, &config.targets),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[targets]]
os = "linux"
arch = "amd64"

[targets.host]
address = "ssh://10.0.0.4:22"
insecure = true

[targets.host.authn]
type = "ssh"
user = "root"
secret = "hunter2"

[[targets.host.proxies]]
address = "socks5://10.0.0.1:1080"

[targets.host.proxies.authn]
type = "proxy"

[artifact]
command = "nginx -g 'daemon off;'"
ports = [80, 443]
volumes = ["/var/log/nginx"]
digest = "sha256:00ff"

[artifact.refer]
uri = "https://example.com/nginx.tar"

[artifact.envs]
WORKERS = "4"

[runtime]
class = "tomcat"
source = "/srv/runtime"

[strategy]
type = "rolling"

[strategy.rolling]
max_surge = 0.5

[timeouts]
create = "15m"
"#;

    #[test]
    fn sample_config_parses() {
        let config: DeploymentConfig = toml::from_str(SAMPLE).unwrap();

        assert_eq!(config.targets.len(), 1);
        let target = &config.targets[0];
        assert_eq!(target.host.host.address, "ssh://10.0.0.4:22");
        assert!(target.host.host.insecure);
        assert_eq!(target.host.proxies.len(), 1);
        assert_eq!(
            target.host.proxies[0].authn.kind,
            courier::host::AuthnKind::Proxy
        );

        assert_eq!(config.artifact.ports, vec![80, 443]);
        assert_eq!(config.artifact.envs.get("WORKERS").map(String::as_str), Some("4"));

        assert_eq!(
            config.strategy.kind,
            courier::deploy::StrategyKind::Rolling
        );
        assert!((config.strategy.rolling.unwrap().max_surge - 0.5).abs() < f64::EPSILON);

        assert_eq!(
            config.timeouts.create().unwrap(),
            Duration::from_secs(15 * 60)
        );
        assert_eq!(config.timeouts.update().unwrap(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn state_round_trips() {
        let temp = tempfile::TempDir::new().unwrap();
        let config_path = Utf8PathBuf::from_path_buf(temp.path().join("deploy.toml")).unwrap();

        let config: DeploymentConfig = toml::from_str(SAMPLE).unwrap();
        let state = State {
            id: "dep1".to_string(),
            artifact: config.artifact,
            targets: config.targets,
        };

        assert!(load_state(&config_path).unwrap().is_none());
        save_state(&config_path, &state).unwrap();

        let loaded = load_state(&config_path).unwrap().unwrap();
        assert_eq!(loaded.id, "dep1");
        assert_eq!(loaded.targets.len(), 1);
        assert_eq!(loaded.artifact.refer.uri, state.artifact.refer.uri);

        remove_state(&config_path).unwrap();
        assert!(load_state(&config_path).unwrap().is_none());
    }
}
