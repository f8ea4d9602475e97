//! Locating AWS access keys.
//!
//! Explicitly configured keys win, then the environment, then the
//! shared credentials file.
use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

// Keep the secret out of logs and error messages
impl std::fmt::Debug for Credentials {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"REDACTED")
            .field("session_token", &self.session_token.as_ref().map(|_| "REDACTED"))
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Parses `key:secret`
    pub fn from_pair(pair: &str) -> anyhow::Result<Self> {
        match pair.split_once(':') {
            Some((key, secret)) if !key.is_empty() && !secret.is_empty() => {
                Ok(Self::new(key, secret))
            }
            _ => anyhow::bail!("credentials must be given as key:secret"),
        }
    }

    /// Resolves credentials for `profile` (`default` when `None`)
    pub fn resolve(explicit: Option<&Credentials>, profile: Option<&str>) -> anyhow::Result<Self> {
        if let Some(creds) = explicit {
            return Ok(creds.clone());
        }
        if let Some(creds) = Self::from_env(|name| std::env::var(name).ok()) {
            return Ok(creds);
        }

        let profile = profile.unwrap_or("default");
        let path = shared_credentials_path()
            .context("no AWS credentials in the environment and no home directory to find a credentials file in")?;
        let text = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "no AWS credentials in the environment and unable to read {}",
                path.display()
            )
        })?;
        Self::from_profile_text(&text, profile)
            .with_context(|| format!("profile {profile} in {}", path.display()))
    }

    fn from_env(var: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let key = var("AWS_ACCESS_KEY_ID").or_else(|| var("AWS_ACCESS_KEY"))?;
        let secret = var("AWS_SECRET_ACCESS_KEY").or_else(|| var("AWS_SECRET_KEY"))?;
        Some(Self {
            access_key_id: key,
            secret_access_key: secret,
            session_token: var("AWS_SESSION_TOKEN").filter(|t| !t.is_empty()),
        })
    }

    /// Extracts a profile from the ini-style shared credentials file
    fn from_profile_text(text: &str, profile: &str) -> anyhow::Result<Self> {
        let mut in_profile = false;
        let mut found = false;
        let mut key = None;
        let mut secret = None;
        let mut token = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_profile = section.trim() == profile;
                found |= in_profile;
                continue;
            }
            if !in_profile {
                continue;
            }
            if let Some((name, value)) = line.split_once('=') {
                let value = value.trim().to_string();
                match name.trim() {
                    "aws_access_key_id" => key = Some(value),
                    "aws_secret_access_key" => secret = Some(value),
                    "aws_session_token" => token = Some(value),
                    _ => {}
                }
            }
        }

        if !found {
            anyhow::bail!("profile not found");
        }
        Ok(Self {
            access_key_id: key.context("aws_access_key_id is missing")?,
            secret_access_key: secret.context("aws_secret_access_key is missing")?,
            session_token: token,
        })
    }
}

fn shared_credentials_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("AWS_SHARED_CREDENTIALS_FILE") {
        return Some(PathBuf::from(path));
    }
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".aws").join("credentials"))
}
