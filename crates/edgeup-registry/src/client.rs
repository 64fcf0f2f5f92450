use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use edgeup_core::{RegistryConfig, RegistryKind};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};

pub const FILESYSTEM_RELEASE_FILE: &str = "latest.json";

/// Raw latest-release document as served by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryDocument {
    pub body: String,
    /// Directory that relative asset locations resolve against, for
    /// registries that live on the local filesystem.
    pub base: Option<PathBuf>,
}

/// Transport used to read the latest-release document.
pub trait RegistryClient: Send + Sync {
    fn describe(&self) -> String;

    fn fetch_latest(&self) -> Result<RegistryDocument>;
}

impl<T: RegistryClient + ?Sized> RegistryClient for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn fetch_latest(&self) -> Result<RegistryDocument> {
        (**self).fetch_latest()
    }
}

impl<T: RegistryClient + ?Sized> RegistryClient for &T {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn fetch_latest(&self) -> Result<RegistryDocument> {
        (**self).fetch_latest()
    }
}

pub struct HttpRegistryClient {
    client: Client,
    url: String,
    token_env: Option<String>,
}

impl HttpRegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build registry HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            token_env: config.token_env.clone(),
        })
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        let Some(name) = &self.token_env else {
            return Ok(None);
        };
        let token = std::env::var(name)
            .with_context(|| format!("registry token variable '{name}' is not set"))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(anyhow!("registry token variable '{name}' is empty"));
        }
        Ok(Some(token.to_string()))
    }
}

impl RegistryClient for HttpRegistryClient {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn fetch_latest(&self) -> Result<RegistryDocument> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json");
        if let Some(token) = self.bearer_token()? {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .with_context(|| format!("failed to query release registry: {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(
                "release registry returned HTTP {status}: {}",
                self.url
            ));
        }

        let body = response
            .text()
            .with_context(|| format!("failed to read registry response: {}", self.url))?;
        Ok(RegistryDocument { body, base: None })
    }
}

/// Registry mirrored into a local directory holding `latest.json`.
pub struct FilesystemRegistryClient {
    root: PathBuf,
}

impl FilesystemRegistryClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RegistryClient for FilesystemRegistryClient {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn fetch_latest(&self) -> Result<RegistryDocument> {
        let path = self.root.join(FILESYSTEM_RELEASE_FILE);
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read release document: {}", path.display()))?;
        Ok(RegistryDocument {
            body,
            base: Some(self.root.clone()),
        })
    }
}

pub fn registry_client_from_config(config: &RegistryConfig) -> Result<Box<dyn RegistryClient>> {
    match config.kind {
        RegistryKind::Http => Ok(Box::new(HttpRegistryClient::new(config)?)),
        RegistryKind::Filesystem => {
            let root = config.url.strip_prefix("file://").unwrap_or(&config.url);
            Ok(Box::new(FilesystemRegistryClient::new(root)))
        }
    }
}
