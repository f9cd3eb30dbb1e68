//! Command line host for the conversion pipeline.

use crate::authorization::{AuthorizationHost, AuthorizationStore, FileAuthorizationStore, OutputDestination};
use crate::config::{ConvertConfig, FileSettings, Settings, StaticSettings};
use crate::error::ConvertError;
use crate::local_fs::LocalResolver;
use crate::notify::TracingNotifier;
use crate::run::{ConversionRequest, RunStatus};
use crate::service::{Collaborators, PipelineService, PipelineStatus};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const AUTHORIZATION_FILE: &str = "authorization.json";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Parser, Debug)]
#[command(name = "nszbox")]
#[command(about = "NSZ Toolbox: convert NSZ/XCZ containers to NSP/XCI", long_about = None)]
pub struct Cli {
    /// Conversion config (TOML or JSON)
    #[arg(short, long, env = "NSZBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the persisted authorization and settings
    #[arg(long, env = "NSZBOX_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// `nszbox` subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Authorize an output folder
    Grant {
        /// Folder converted files are written to
        folder: PathBuf,
    },
    /// Forget the authorized output folder
    Revoke,
    /// Persist whether sources are deleted after a successful conversion
    SetDelete {
        /// `true` or `false`
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Show the authorized folder and settings
    Status,
    /// Convert one container
    Convert {
        /// Compressed source file
        source: PathBuf,
        /// Folder to authorize if none is authorized yet
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Delete the source after success, overriding the saved setting
        #[arg(long)]
        delete_source: bool,
    },
}

/// Answers authorization requests the way an interactive folder picker would:
/// each request is forwarded to the CLI driver, which grants or denies.
struct PromptHost {
    requests: mpsc::UnboundedSender<()>,
}

impl AuthorizationHost for PromptHost {
    fn request_authorization(&self) {
        if self.requests.send(()).is_err() {
            debug!("Authorization prompt is gone");
        }
    }

    fn is_valid(&self, destination: &OutputDestination) -> bool {
        LocalResolver::is_writable_dir(&LocalResolver::path_of(&destination.folder))
    }
}

/// Default state directory: `$XDG_CONFIG_HOME/nszbox`, else `~/.config/nszbox`.
pub fn default_state_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("nszbox")
}

/// Persist the granted folder as the cached destination hint.
fn remember_destination(settings: &FileSettings, destination: &OutputDestination) -> Result<()> {
    let mut snapshot = settings.load()?;
    snapshot.cached_destination = Some(destination.folder.to_string());
    settings.save(&snapshot)?;
    Ok(())
}

fn folder_destination(folder: &Path) -> Result<OutputDestination> {
    let folder = folder
        .canonicalize()
        .with_context(|| format!("cannot access {}", folder.display()))?;
    if !LocalResolver::is_writable_dir(&folder) {
        anyhow::bail!("{} is not a writable directory", folder.display());
    }
    Ok(OutputDestination::for_folder(LocalResolver::reference_for(&folder)))
}

impl Cli {
    /// Execute the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Grant { ref folder } => self.grant(folder),
            Command::Revoke => self.revoke(),
            Command::SetDelete { enabled } => self.set_delete(enabled),
            Command::Status => self.status(),
            Command::Convert { ref source, ref output, delete_source } => {
                self.convert(source, output.as_deref(), delete_source).await
            }
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    fn store(&self) -> FileAuthorizationStore {
        FileAuthorizationStore::new(self.state_dir().join(AUTHORIZATION_FILE))
    }

    fn settings(&self) -> FileSettings {
        FileSettings::new(self.state_dir().join(SETTINGS_FILE))
    }

    fn load_config(&self) -> Result<ConvertConfig> {
        match &self.config {
            Some(path) => Ok(ConvertConfig::from_file(path)?),
            None => Ok(ConvertConfig::default()),
        }
    }

    fn update_settings(&self, apply: impl FnOnce(&mut StaticSettings)) -> Result<()> {
        let settings = self.settings();
        let mut snapshot = settings.load()?;
        apply(&mut snapshot);
        settings.save(&snapshot)?;
        Ok(())
    }

    fn grant(&self, folder: &Path) -> Result<()> {
        let destination = folder_destination(folder)?;
        self.store().save(&destination)?;
        remember_destination(&self.settings(), &destination)?;
        println!("Output folder set: {}", destination.folder);
        Ok(())
    }

    fn revoke(&self) -> Result<()> {
        self.store().revoke()?;
        self.update_settings(|s| s.cached_destination = None)?;
        println!("Output folder authorization revoked");
        Ok(())
    }

    fn set_delete(&self, enabled: bool) -> Result<()> {
        self.update_settings(|s| s.delete_source_on_success = enabled)?;
        println!("Delete source after conversion: {}", enabled);
        Ok(())
    }

    fn status(&self) -> Result<()> {
        let settings = self.settings().load()?;
        match self.store().load()? {
            Some(destination) => {
                let live = LocalResolver::is_writable_dir(&LocalResolver::path_of(&destination.folder));
                println!(
                    "Output folder: {} (granted {}{})",
                    destination.folder,
                    destination.granted_at.to_rfc3339(),
                    if live { "" } else { ", no longer writable" }
                );
            }
            None => println!("Output folder: not set"),
        }
        println!("Delete source after conversion: {}", settings.delete_source_on_success);
        Ok(())
    }

    async fn convert(&self, source: &Path, output: Option<&Path>, delete_source: bool) -> Result<()> {
        let config = self.load_config()?;
        let settings = Arc::new(self.settings());
        let (prompt_tx, mut prompt_rx) = mpsc::unbounded_channel();

        let handle = PipelineService::start(
            config,
            Collaborators {
                resolver: Arc::new(LocalResolver::new()),
                store: Arc::new(self.store()),
                host: Arc::new(PromptHost { requests: prompt_tx }),
                notifier: Arc::new(TracingNotifier),
                settings: settings.clone(),
            },
        );

        let responder = {
            let handle = handle.clone();
            let settings = Arc::clone(&settings);
            let destination = output.map(folder_destination).transpose()?;
            tokio::spawn(async move {
                while prompt_rx.recv().await.is_some() {
                    let sent = match &destination {
                        Some(destination) => {
                            if let Err(e) = remember_destination(&settings, destination) {
                                warn!(error = %e, "Cached destination not saved");
                            }
                            handle.grant_authorization(destination.clone()).await
                        }
                        None => handle.authorization_denied().await,
                    };
                    if let Err(e) = sent {
                        debug!(error = %e, "Authorization answer not delivered");
                    }
                }
            })
        };

        let source = LocalResolver::reference_for(source);
        let delete = delete_source || settings.delete_source_on_success();
        handle.submit_request(ConversionRequest::new(source, delete)).await?;

        let status = handle.wait_until(|s| s.runs_completed > 0 || s.canceled > 0).await?;
        handle.shutdown().await?;
        responder.abort();

        report(&status)
    }
}

fn report(status: &PipelineStatus) -> Result<()> {
    let Some(result) = &status.last_result else {
        return Err(anyhow::Error::new(ConvertError::AuthorizationDenied)
            .context("no output folder authorized; run `nszbox grant <folder>` or pass --output"));
    };
    match &result.status {
        RunStatus::Success => {
            if let Some(output) = &result.output {
                println!("Done! Wrote {} bytes to {}", result.bytes_copied, output);
            }
            for warning in &result.warnings {
                println!("Warning: {}", warning.reason);
            }
            if let Some(log) = &result.log {
                println!("Log: {}", log);
            }
            Ok(())
        }
        RunStatus::Failure { kind, reason } => {
            if let Some(log) = &result.log {
                println!("Log: {}", log);
            }
            anyhow::bail!("conversion failed ({}): {}", kind, reason)
        }
    }
}
