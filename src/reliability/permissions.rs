use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Command '{command}' failed: {status}")]
    CommandFailed { command: String, status: String },
    #[error("Could not determine current identity: {0}")]
    IdentityUnavailable(String),
}

/// Restricts overflow directories to the current user.
///
/// Unix gets mode 0o700 on the directory. Windows gets an explicit ACL
/// (Administrators plus the current identity, inheritance removed) applied
/// with `icacls`. Each directory is hardened at most once per instance.
#[derive(Debug, Default)]
pub struct FilePermissions {
    hardened: Mutex<HashSet<PathBuf>>,
    #[cfg_attr(not(windows), allow(dead_code))]
    identity: Mutex<Option<String>>,
}

impl FilePermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_hardened(&self, dir: &Path) -> bool {
        self.hardened.lock().contains(dir)
    }

    pub async fn harden_directory(&self, dir: &Path) -> Result<(), PermissionError> {
        if self.is_hardened(dir) {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        #[cfg(windows)]
        {
            let identity = match self.cached_identity() {
                Some(identity) => identity,
                None => {
                    let output = tokio::process::Command::new("powershell")
                        .args(windows::IDENTITY_ARGS)
                        .output()
                        .await?;
                    self.remember_identity(windows::parse_identity(output)?)
                }
            };
            let output = tokio::process::Command::new("icacls")
                .args(windows::icacls_args(dir, &identity))
                .output()
                .await?;
            windows::check_status("icacls", &output)?;
        }

        self.hardened.lock().insert(dir.to_path_buf());
        Ok(())
    }

    pub fn harden_directory_sync(&self, dir: &Path) -> Result<(), PermissionError> {
        if self.is_hardened(dir) {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }

        #[cfg(windows)]
        {
            let identity = match self.cached_identity() {
                Some(identity) => identity,
                None => {
                    let output = std::process::Command::new("powershell")
                        .args(windows::IDENTITY_ARGS)
                        .output()?;
                    self.remember_identity(windows::parse_identity(output)?)
                }
            };
            let output = std::process::Command::new("icacls")
                .args(windows::icacls_args(dir, &identity))
                .output()?;
            windows::check_status("icacls", &output)?;
        }

        self.hardened.lock().insert(dir.to_path_buf());
        Ok(())
    }

    #[cfg(windows)]
    fn cached_identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    #[cfg(windows)]
    fn remember_identity(&self, identity: String) -> String {
        *self.identity.lock() = Some(identity.clone());
        identity
    }
}

#[cfg(windows)]
mod windows {
    use super::PermissionError;
    use std::ffi::OsString;
    use std::path::Path;
    use std::process::Output;

    pub const IDENTITY_ARGS: [&str; 4] = [
        "-NoProfile",
        "-NonInteractive",
        "-Command",
        "[System.Security.Principal.WindowsIdentity]::GetCurrent().Name",
    ];

    // Well-known SID of the local Administrators group.
    const ADMINISTRATORS_SID: &str = "*S-1-5-32-544";

    pub fn icacls_args(dir: &Path, identity: &str) -> Vec<OsString> {
        vec![
            dir.as_os_str().to_os_string(),
            "/grant".into(),
            format!("{ADMINISTRATORS_SID}:(OI)(CI)F").into(),
            "/grant".into(),
            format!("{identity}:(OI)(CI)F").into(),
            "/inheritance:r".into(),
        ]
    }

    pub fn check_status(command: &str, output: &Output) -> Result<(), PermissionError> {
        if output.status.success() {
            Ok(())
        } else {
            Err(PermissionError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
            })
        }
    }

    pub fn parse_identity(output: Output) -> Result<String, PermissionError> {
        check_status("powershell", &output)?;
        let identity = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if identity.is_empty() {
            return Err(PermissionError::IdentityUnavailable(
                "empty identity".to_string(),
            ));
        }
        Ok(identity)
    }
}
