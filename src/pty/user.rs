use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::unistd::{Uid, User};

/// The OS account a server and its shells run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl From<User> for UserContext {
    fn from(user: User) -> Self {
        let shell = if user.shell.as_os_str().is_empty() {
            PathBuf::from("/bin/sh")
        } else {
            user.shell
        };
        Self {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            name: user.name,
            home: user.dir,
            shell,
        }
    }
}

impl UserContext {
    /// Look up a numeric uid in the user database.
    pub fn from_uid(uid: u32) -> Result<Option<Self>> {
        let user = User::from_uid(Uid::from_raw(uid))
            .with_context(|| format!("Failed to look up uid {}", uid))?;
        Ok(user.map(Self::from))
    }

    /// Resolve a client-supplied identity: a user name, or a numeric uid.
    pub fn resolve(identity: &str) -> Result<Option<Self>> {
        if identity.is_empty() {
            return Ok(None);
        }
        if let Some(user) = User::from_name(identity)
            .with_context(|| format!("Failed to look up user '{}'", identity))?
        {
            return Ok(Some(user.into()));
        }
        match identity.parse::<u32>() {
            Ok(uid) => Self::from_uid(uid),
            Err(_) => Ok(None),
        }
    }

    /// The user this process runs as.
    pub fn current() -> Result<Self> {
        let uid = nix::unistd::getuid().as_raw();
        Self::from_uid(uid)?.with_context(|| format!("Current uid {} has no passwd entry", uid))
    }

    /// Replace the login shell, e.g. from the `server.shell` setting.
    pub fn with_shell(mut self, shell: Option<&str>) -> Self {
        if let Some(shell) = shell {
            self.shell = PathBuf::from(shell);
        }
        self
    }

    /// Whether a process running as the current user may act as `self`:
    /// root may act as anyone, everyone else only as themselves.
    pub fn is_reachable_from_current(&self) -> bool {
        let me = nix::unistd::geteuid();
        me.is_root() || me.as_raw() == self.uid
    }
}
