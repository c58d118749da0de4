//! Where settings come from: the packaged template and the override file.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Template packaged with the binary.
pub const PACKAGED_TEMPLATE: &str = include_str!("template.yaml");

/// Provider of template and override text.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Template text (definitions + defaults).
    fn template(&self) -> &str;

    /// Override file text, or `None` when no override file exists.
    async fn read_overrides(&self) -> io::Result<Option<String>>;

    /// Replace the override file contents.
    async fn write_overrides(&self, text: &str) -> io::Result<()>;

    /// Human-readable location of the overrides, for logs.
    fn describe(&self) -> String;
}

/// Packaged template plus a YAML override file on disk.
#[derive(Debug, Clone)]
pub struct FileSettingsSource {
    template: String,
    override_path: PathBuf,
}

impl FileSettingsSource {
    /// Use the packaged template with overrides at `override_path`.
    pub fn new(override_path: impl Into<PathBuf>) -> Self {
        Self {
            template: PACKAGED_TEMPLATE.to_string(),
            override_path: override_path.into(),
        }
    }

    /// Use a custom template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn override_path(&self) -> &Path {
        &self.override_path
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    fn template(&self) -> &str {
        &self.template
    }

    async fn read_overrides(&self) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string(&self.override_path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_overrides(&self, text: &str) -> io::Result<()> {
        if let Some(parent) = self.override_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write-then-rename so a crash never leaves a truncated override file.
        let staging = self.override_path.with_extension("yaml.tmp");
        tokio::fs::write(&staging, text).await?;
        tokio::fs::rename(&staging, &self.override_path).await
    }

    fn describe(&self) -> String {
        self.override_path.display().to_string()
    }
}
