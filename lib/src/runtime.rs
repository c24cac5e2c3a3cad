//! Runtime bundle sources: a directory tree of per-OS service scripts,
//! `<class>/<os>/service.{sh|ps1}`, from a local directory or a git
//! repository.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use tempfile::TempDir;
use tracing::debug;

use crate::host::AuthnKind;

// Entry reserved for shared helpers, not a runtime class.
const RESERVED_LIB: &str = "lib";

/// A materialized, read-only runtime bundle.
pub struct Source {
    root: Utf8PathBuf,
    // Keeps a cloned checkout alive for the source's lifetime.
    _temp: Option<TempDir>,
}

impl Source {
    /// Uses a local directory as the bundle.
    pub fn local(dir: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = dir.into();
        ensure!(root.is_dir(), "runtime source {root} is not a directory");

        Ok(Self { root, _temp: None })
    }

    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

/// Options for fetching an external git source.
#[derive(Debug, Clone, Default)]
pub struct ExternalOptions {
    /// Git URL, optionally with a `//subpath` suffix and a `?ref=` query.
    pub source: String,
    pub authn: Option<ExternalAuthn>,
    pub insecure: bool,
}

/// Authentication for fetching the runtime, `basic` or `bearer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAuthn {
    #[serde(rename = "type")]
    pub kind: AuthnKind,
    #[serde(default)]
    pub user: String,
    pub secret: String,
}

/// Clones the external source into a temporary checkout.
pub async fn external(opts: ExternalOptions) -> Result<Source> {
    tokio::task::spawn_blocking(move || clone_source(&opts))
        .await
        .context("clone task failed")?
}

fn clone_source(opts: &ExternalOptions) -> Result<Source> {
    let mut url =
        url::Url::parse(&opts.source).context("failed to parse external source URL")?;

    // `https://host/repo//sub/path` addresses a subdirectory of the
    // checkout.
    let mut subpath = String::new();
    if let Some((path, sub)) = url.path().to_string().split_once("//") {
        subpath = sub.to_string();
        url.set_path(path);
    }

    // `?ref=name` selects a branch or tag.
    let mut reference = String::new();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if pairs.iter().any(|(key, _)| key == "ref") {
        let mut kept = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            if key == "ref" {
                reference = value;
            } else {
                kept.push((key, value));
            }
        }

        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    let temp = tempfile::Builder::new()
        .prefix("courier-")
        .tempdir()
        .context("cannot create checkout directory")?;

    let repo = {
        let shallow = clone_repo(opts, url.as_str(), temp.path(), Some(&reference), true);
        match shallow {
            Ok(repo) => repo,
            Err(err) if !reference.is_empty() => {
                // The reference may be a tag, which a shallow branch clone
                // cannot fetch; fall back to a full clone and check it out.
                debug!(error = ?err, reference = %reference, "branch clone failed, retrying full");
                let repo = clone_repo(opts, url.as_str(), temp.path(), None, false)?;
                checkout_reference(&repo, &reference)?;
                repo
            }
            Err(err) => return Err(err),
        }
    };
    drop(repo);

    let root = Utf8Path::from_path(temp.path())
        .context("checkout path is not UTF-8")?
        .to_path_buf();
    let root = if subpath.is_empty() {
        root
    } else {
        let chrooted = root.join(&subpath);
        ensure!(
            chrooted.is_dir(),
            "failed to chroot subpath {subpath} of the external source"
        );
        chrooted
    };

    Ok(Source {
        root,
        _temp: Some(temp),
    })
}

fn clone_repo(
    opts: &ExternalOptions,
    url: &str,
    into: &std::path::Path,
    branch: Option<&str>,
    shallow: bool,
) -> Result<git2::Repository> {
    let mut callbacks = git2::RemoteCallbacks::new();

    if let Some(authn) = opts.authn.clone() {
        callbacks.credentials(move |_url, _user, _allowed| match authn.kind {
            // Forges accept tokens in the username slot for bearer auth.
            AuthnKind::Bearer => git2::Cred::userpass_plaintext(&authn.secret, ""),
            _ => git2::Cred::userpass_plaintext(&authn.user, &authn.secret),
        });
    }

    if opts.insecure {
        callbacks.certificate_check(|_cert, _host| Ok(git2::CertificateCheckStatus::CertificateOk));
    }

    let mut fetch = git2::FetchOptions::new();
    fetch.remote_callbacks(callbacks);
    if shallow {
        fetch.depth(1);
    }

    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch);
    if let Some(branch) = branch.filter(|b| !b.is_empty()) {
        builder.branch(branch);
    }

    builder
        .clone(url, into)
        .context("failed to clone git external source")
}

fn checkout_reference(repo: &git2::Repository, reference: &str) -> Result<()> {
    let object = repo
        .revparse_single(&format!("refs/tags/{reference}"))
        .or_else(|_| repo.revparse_single(reference))
        .with_context(|| format!("reference {reference} not found in external source"))?;

    let commit = object
        .peel_to_commit()
        .context("reference does not point at a commit")?;

    repo.checkout_tree(
        commit.as_object(),
        Some(git2::build::CheckoutBuilder::new().force()),
    )?;
    repo.set_head_detached(commit.id())?;

    Ok(())
}

// Classes --------------------------------------------------------------------

/// Runtime classes and the operating systems each one supports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classes(BTreeMap<String, BTreeSet<String>>);

impl Classes {
    #[must_use]
    pub fn has(&self, class: &str) -> bool {
        self.0.contains_key(class)
    }

    #[must_use]
    pub fn has_os(&self, class: &str, os: &str) -> bool {
        self.0.get(class).is_some_and(|oses| oses.contains(os))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.0.iter().map(|(class, oses)| (class.as_str(), oses))
    }
}

/// Enumerates the source's runtime classes. The reserved `lib` entry and
/// empty class directories are skipped.
pub fn classes(source: &Source) -> Result<Classes> {
    let mut found = BTreeMap::new();

    let entries = source
        .root()
        .read_dir_utf8()
        .context("failed to get runtimes list")?;

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let class = entry.file_name().to_string();
        if class == RESERVED_LIB {
            continue;
        }

        let mut oses = BTreeSet::new();
        let os_entries = entry.path().read_dir_utf8().with_context(|| {
            format!("failed to get os list of runtime {class}")
        })?;
        for os_entry in os_entries {
            let os_entry = os_entry?;
            oses.insert(os_entry.file_name().to_string());
        }

        if oses.is_empty() {
            continue;
        }

        found.insert(class, oses);
    }

    Ok(Classes(found))
}
