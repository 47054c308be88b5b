use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_SSH_KEY: &str = "~/.ssh/id_rsa";
pub const DEFAULT_APP_PORT: u16 = 3000;

/// Repository access token. Never printed: `Debug` and `Display` both render `***`.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Which build descriptor the working copy carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Dockerfile,
    Compose { file: String },
}

impl Descriptor {
    pub fn describe(&self) -> String {
        match self {
            Descriptor::Dockerfile => "Dockerfile (single container)".into(),
            Descriptor::Compose { file } => format!("{file} (compose)"),
        }
    }
}

/// Clone URL with the token placed in its userinfo part.
#[derive(Debug, Clone)]
pub struct AuthUrl {
    pub url: String,
    // The userinfo exactly as it appears in `url` (percent-encoded).
    pub userinfo: String,
}

/// Everything a run needs, collected once and never changed afterwards.
#[derive(Debug, Clone)]
pub struct RunParameters {
    pub repo_url: String,
    pub token: AccessToken,
    pub branch: String,
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_key: PathBuf,
    pub app_port: u16,
}

impl RunParameters {
    /// Directory name of the working copy, also used as the remote directory name.
    pub fn project_dir_name(&self) -> Result<String> {
        repo_dir_name(&self.repo_url)
    }

    /// Container, image and nginx site name.
    pub fn container_name(&self) -> Result<String> {
        Ok(container_name(&self.project_dir_name()?))
    }

    pub fn ssh_destination(&self) -> String {
        format!("{}@{}", self.ssh_user, self.ssh_host)
    }

    /// `None` when the URL is not http(s); such URLs are cloned as given.
    pub fn authenticated_url(&self) -> Result<Option<AuthUrl>> {
        let Ok(mut parsed) = Url::parse(self.repo_url.trim()) else {
            return Ok(None);
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return Ok(None);
        }
        parsed
            .set_username(self.token.expose())
            .and_then(|_| parsed.set_password(None))
            .map_err(|_| Error::input("repository URL cannot carry credentials"))?;
        let userinfo = parsed.username().to_string();
        Ok(Some(AuthUrl {
            url: parsed.to_string(),
            userinfo,
        }))
    }
}

/// Raw answers as typed (or preset); blank means "not provided".
#[derive(Debug, Clone, Default)]
pub struct RawInputs {
    pub repo_url: String,
    pub token: String,
    pub branch: String,
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_key: String,
    pub app_port: String,
}

impl RawInputs {
    pub fn resolve(self) -> Result<RunParameters> {
        let repo_url = required(&self.repo_url, "repository URL")?;
        let token = required(&self.token, "access token")?;
        let branch = or_default(&self.branch, DEFAULT_BRANCH);
        let ssh_user = required(&self.ssh_user, "SSH user")?;
        let ssh_host = required(&self.ssh_host, "SSH host")?;
        let ssh_key = expand_home(&or_default(&self.ssh_key, DEFAULT_SSH_KEY))?;
        let app_port = parse_port(&self.app_port)?;

        check_key_readable(&ssh_key)?;
        repo_dir_name(&repo_url)?;

        Ok(RunParameters {
            repo_url,
            token: AccessToken::new(token),
            branch,
            ssh_user,
            ssh_host,
            ssh_key,
            app_port,
        })
    }
}

fn required(raw: &str, what: &str) -> Result<String> {
    let v = raw.trim();
    if v.is_empty() {
        return Err(Error::input(format!("{what} is required")));
    }
    Ok(v.to_string())
}

fn or_default(raw: &str, default: &str) -> String {
    let v = raw.trim();
    if v.is_empty() {
        default.to_string()
    } else {
        v.to_string()
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    let v = raw.trim();
    if v.is_empty() {
        return Ok(DEFAULT_APP_PORT);
    }
    match v.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(Error::input(format!(
            "application port '{v}' is not a port number (1-65535)"
        ))),
    }
}

pub fn expand_home(raw: &str) -> Result<PathBuf> {
    let Some(rest) = raw.strip_prefix('~') else {
        return Ok(PathBuf::from(raw));
    };
    if !rest.is_empty() && !rest.starts_with('/') {
        // ~otheruser/... is left to the shell; we do not resolve other users.
        return Ok(PathBuf::from(raw));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::input(format!("cannot expand '{raw}': no home directory")))?;
    Ok(home.join(rest.trim_start_matches('/')))
}

fn check_key_readable(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(Error::input(format!(
            "SSH key {} does not exist or is not a file",
            path.display()
        )));
    }
    File::open(path)
        .map(|_| ())
        .map_err(|e| Error::input(format!("SSH key {} is not readable: {e}", path.display())))
}

/// `https://github.com/acme/web-app.git` -> `web-app`.
pub fn repo_dir_name(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or_default();
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::input(format!(
            "cannot derive a project name from repository URL '{url}'"
        )));
    }
    Ok(name.to_string())
}

/// Lowercase `[a-z0-9][a-z0-9_-]*` ending in a letter or digit, so the same
/// name works as compose project, container, image tag and nginx site.
pub fn container_name(dir_name: &str) -> String {
    let mapped: String = dir_name
        .chars()
        .map(|ch| {
            let ch = ch.to_ascii_lowercase();
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let out = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if out.is_empty() {
        "app".into()
    } else {
        out.to_string()
    }
}
