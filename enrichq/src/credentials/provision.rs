//! Provisioning collaborator: exchanges a raw account for a fresh credential.
//!
//! The login flow itself lives outside this crate. [`CommandProvisioner`]
//! shells out to a configured helper program that receives the account via
//! environment variables and prints the credential on stdout.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use super::Credential;
use crate::identifiers::RawAccount;

pub const ACCOUNT_ID_ENV: &str = "ENRICHQ_ACCOUNT_ID";
pub const ACCOUNT_SECRET_ENV: &str = "ENRICHQ_ACCOUNT_SECRET";

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("no provisioner configured")]
    Unavailable,

    #[error("provisioning rejected for {account}: {reason}")]
    Rejected { account: String, reason: String },

    #[error("provisioner produced no credential for {0}")]
    EmptyOutput(String),

    #[error("provisioner timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to run provisioner: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, account: &RawAccount) -> Result<Credential, ProvisionError>;
}

/// Used when no provisioning command is configured; every account fails
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledProvisioner;

#[async_trait]
impl Provisioner for DisabledProvisioner {
    async fn provision(&self, _account: &RawAccount) -> Result<Credential, ProvisionError> {
        Err(ProvisionError::Unavailable)
    }
}

/// Runs an external helper program once per account
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProvisioner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

/// Last non-empty stdout line is the credential
pub fn parse_provisioner_output(stdout: &str) -> Option<Credential> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(Credential::new)
        .filter(|credential| !credential.is_empty())
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, account: &RawAccount) -> Result<Credential, ProvisionError> {
        debug!("Provisioning credential for {}", account.identifier);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(ACCOUNT_ID_ENV, &account.identifier)
            .env(ACCOUNT_SECRET_ENV, &account.secret)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let run = async {
            let mut out = String::new();
            let mut err = String::new();
            let read_out = async {
                if let Some(pipe) = stdout.as_mut() {
                    pipe.read_to_string(&mut out).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let read_err = async {
                if let Some(pipe) = stderr.as_mut() {
                    pipe.read_to_string(&mut err).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            tokio::try_join!(read_out, read_err)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, out, err) = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => return Err(ProvisionError::Timeout(self.timeout)),
        };

        if !status.success() {
            let reason = err.lines().last().unwrap_or("").trim().to_string();
            return Err(ProvisionError::Rejected {
                account: account.identifier.clone(),
                reason: if reason.is_empty() {
                    format!("exit status {}", status)
                } else {
                    reason
                },
            });
        }

        parse_provisioner_output(&out).ok_or_else(|| ProvisionError::EmptyOutput(account.identifier.clone()))
    }
}
