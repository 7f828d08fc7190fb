//! Installation of validated artifacts.
//!
//! The [`Applier`] is the only writer of the live configuration files.
//! Files are replaced with write-then-rename, never edited in place, and
//! the proxy is asked for a graceful reload afterwards.  If the reload
//! cannot be delivered, or does not finish before the cycle deadline, the
//! previous files are put back so that what is on disk matches what the
//! proxy is serving.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout_at, Instant};

use crate::error::ApplyError;
use crate::render::ConfigArtifact;

/// Where the live artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub upstreams: PathBuf,
    pub locations: PathBuf,
}

/// Delivers a graceful reload to the running proxy.
#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self) -> Result<(), ApplyError>;
}

/// Reloads by running a command such as `nginx -s reload`.
#[derive(Debug, Clone)]
pub struct CommandReloader {
    command: Vec<String>,
}

impl CommandReloader {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Reloader for CommandReloader {
    async fn reload(&self) -> Result<(), ApplyError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ApplyError::Reload("reload command is empty".into()))?;

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ApplyError::Reload(format!("unable to run `{}`: {}", program, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ApplyError::Reload(format!(
                "`{}` exited with {}: {}",
                self.command.join(" "),
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// What the live files held before an install.
#[derive(Debug)]
struct Previous {
    upstreams: Option<String>,
    locations: Option<String>,
}

pub struct Applier {
    paths: ArtifactPaths,
    reloader: Box<dyn Reloader>,
}

impl Applier {
    pub fn new(paths: ArtifactPaths, reloader: Box<dyn Reloader>) -> Self {
        Self { paths, reloader }
    }

    #[cfg(test)]
    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    /// Install a validated artifact and reload the proxy.
    ///
    /// Once started this is not abandoned halfway: a reload still pending at
    /// `deadline` is treated as failed and the previous files are restored,
    /// so the live pair is always either the new one or the old one.
    pub async fn apply(
        &self,
        artifact: &ConfigArtifact,
        deadline: Instant,
    ) -> Result<(), ApplyError> {
        let previous = Previous {
            upstreams: self.read_live(&self.paths.upstreams).await?,
            locations: self.read_live(&self.paths.locations).await?,
        };

        self.install(artifact.upstreams(), artifact.locations(), &previous)
            .await?;
        debug!(
            "Installed {} and {}",
            self.paths.upstreams.display(),
            self.paths.locations.display()
        );

        let reloaded = match timeout_at(deadline, self.reloader.reload()).await {
            Ok(reloaded) => reloaded,
            Err(_) => Err(ApplyError::ReloadTimedOut),
        };
        if let Err(reload) = reloaded {
            error!("Reload failed, restoring previous artifact: {}", reload);
            return match self.restore(&previous).await {
                Ok(()) => Err(reload),
                Err(restore) => Err(ApplyError::Restore {
                    reload: reload.to_string(),
                    restore: restore.to_string(),
                }),
            };
        }

        info!("Proxy reloaded with artifact {}", artifact.digest());
        Ok(())
    }

    async fn read_live(&self, path: &Path) -> Result<Option<String>, ApplyError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ApplyError::Install {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn install(
        &self,
        upstreams: &str,
        locations: &str,
        previous: &Previous,
    ) -> Result<(), ApplyError> {
        atomic_write(&self.paths.upstreams, upstreams)
            .await
            .map_err(|source| ApplyError::Install {
                path: self.paths.upstreams.clone(),
                source,
            })?;

        if let Err(source) = atomic_write(&self.paths.locations, locations).await {
            // Upstreams without their locations are harmless but leave them as they were.
            if let Err(e) = put_back(&self.paths.upstreams, previous.upstreams.as_deref()).await {
                error!(
                    "Unable to restore {}: {}",
                    self.paths.upstreams.display(),
                    e
                );
            }
            return Err(ApplyError::Install {
                path: self.paths.locations.clone(),
                source,
            });
        }
        Ok(())
    }

    async fn restore(&self, previous: &Previous) -> io::Result<()> {
        put_back(&self.paths.upstreams, previous.upstreams.as_deref()).await?;
        put_back(&self.paths.locations, previous.locations.as_deref()).await
    }
}

async fn put_back(path: &Path, contents: Option<&str>) -> io::Result<()> {
    match contents {
        Some(contents) => atomic_write(path, contents).await,
        None => match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

/// Write `contents` to a sibling temporary file and rename it over `path`.
pub async fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    // Make the rename itself durable.
    if let Ok(dir) = tokio::fs::File::open(dir).await {
        let _ = dir.sync_all().await;
    }
    Ok(())
}
