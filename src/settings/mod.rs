//! Versioned key/value settings.
//!
//! Definitions come from a packaged template; values are a mutable overlay
//! merged from an optional override file. Reads go straight to a concurrent
//! map and never wait for writers. Writers hold a short write section only
//! while mutating the map; persistence and change notifications happen after
//! it is released, so a notification handler may read back into the
//! repository freely.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::bus::{RelayBus, SubscriptionId};

mod model;
mod source;

pub use model::{Setting, SettingDefinition, SettingValue, SettingsDocument, ValueType};
pub use source::{FileSettingsSource, SettingsSource, PACKAGED_TEMPLATE};

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Errors that can occur in the settings repository.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings template is invalid: {0}")]
    Template(#[source] serde_yaml::Error),

    #[error("Setting '{path}' rejected: {reason}")]
    Rejected { path: String, reason: String },
}

const REDACTED: &str = "***";

/// Merge an override document over the template.
///
/// New definitions are appended; a redefinition of a template path is ignored.
/// Values are replaced by path; template values not overridden are kept.
pub fn merge_documents(template: SettingsDocument, overrides: SettingsDocument) -> SettingsDocument {
    let mut merged = template;

    let known: HashSet<String> = merged.definitions.iter().map(|d| d.path.clone()).collect();
    for definition in overrides.definitions {
        if known.contains(&definition.path) {
            debug!(path = %definition.path, "Ignoring override of packaged definition");
            continue;
        }
        merged.definitions.push(definition);
    }

    for value in overrides.values {
        match merged.values.iter_mut().find(|v| v.path == value.path) {
            Some(existing) => existing.value = value.value,
            None => merged.values.push(value),
        }
    }

    merged
}

/// Thread-safe settings store publishing changes on the relay bus path channel.
pub struct SettingsRepository {
    definitions: HashMap<String, SettingDefinition>,
    values: DashMap<String, String>,
    template_values: HashMap<String, String>,
    template_definitions: HashSet<String>,
    write_section: Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    source: Arc<dyn SettingsSource>,
    bus: Arc<RelayBus>,
}

impl SettingsRepository {
    /// Load the template, merge any override file, and return a ready repository.
    ///
    /// An invalid packaged template is a programming error and fails. A
    /// missing, unreadable or malformed override file falls back to the
    /// template alone.
    pub async fn initialize(source: Arc<dyn SettingsSource>, bus: Arc<RelayBus>) -> Result<Arc<Self>> {
        let template =
            SettingsDocument::from_yaml(source.template()).map_err(SettingsError::Template)?;

        let overrides = match source.read_overrides().await {
            Ok(Some(text)) => match SettingsDocument::from_yaml(&text) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(
                        location = %source.describe(),
                        error = %e,
                        "Override file is malformed, using template settings only"
                    );
                    None
                }
            },
            Ok(None) => {
                debug!(location = %source.describe(), "No override file present");
                None
            }
            Err(e) => {
                warn!(
                    location = %source.describe(),
                    error = %e,
                    "Override file is unreadable, using template settings only"
                );
                None
            }
        };

        let template_values: HashMap<String, String> = template
            .values
            .iter()
            .map(|v| (v.path.clone(), v.value.clone()))
            .collect();
        let template_definitions: HashSet<String> =
            template.definitions.iter().map(|d| d.path.clone()).collect();

        let merged = match overrides {
            Some(overrides) => merge_documents(template, overrides),
            None => template,
        };

        let definitions: HashMap<String, SettingDefinition> = merged
            .definitions
            .into_iter()
            .map(|d| (d.path.clone(), d))
            .collect();

        let values = DashMap::new();
        for value in merged.values {
            if !definitions.contains_key(&value.path) {
                info!(path = %value.path, "Loaded setting value without a definition");
            }
            values.insert(value.path, value.value);
        }

        info!(
            definitions = definitions.len(),
            values = values.len(),
            location = %source.describe(),
            "Settings repository ready"
        );

        Ok(Arc::new(Self {
            definitions,
            values,
            template_values,
            template_definitions,
            write_section: Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            source,
            bus,
        }))
    }

    /// Current value, else the definition default, else `None`.
    pub fn get_value_or_default(&self, path: &str) -> Option<String> {
        if let Some(value) = self.values.get(path) {
            return Some(value.value().clone());
        }
        self.definitions
            .get(path)
            .and_then(|d| d.default_value.clone())
    }

    /// Value set locally (override file or `apply_overrides`) that differs
    /// from the packaged template, else `None`.
    pub fn get_override(&self, path: &str) -> Option<String> {
        let value = self.values.get(path)?.value().clone();
        (self.template_values.get(path) != Some(&value)).then_some(value)
    }

    /// Value paired with its definition.
    pub fn get_setting(&self, path: &str) -> Option<Setting> {
        let value = self.get_value_or_default(path)?;
        Some(Setting {
            path: path.to_string(),
            value,
            definition: self.definitions.get(path).cloned(),
        })
    }

    pub fn get_definition(&self, path: &str) -> Option<&SettingDefinition> {
        self.definitions.get(path)
    }

    /// All definitions, ordered by path.
    pub fn get_all_definitions(&self) -> Vec<SettingDefinition> {
        let mut definitions: Vec<_> = self.definitions.values().cloned().collect();
        definitions.sort_by(|a, b| a.path.cmp(&b.path));
        definitions
    }

    /// All explicitly set values, ordered by path.
    pub fn get_all_values(&self) -> Vec<SettingValue> {
        let mut values: Vec<_> = self
            .values
            .iter()
            .map(|e| SettingValue::new(e.key().clone(), e.value().clone()))
            .collect();
        values.sort_by(|a, b| a.path.cmp(&b.path));
        values
    }

    /// Register for change notifications on `path` and everything beneath it.
    pub fn register_for_change_messages<F>(&self, path: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&SettingValue) + Send + Sync + 'static,
    {
        self.bus.register_path(path, handler)
    }

    pub fn unregister_change_messages(&self, id: SubscriptionId) -> bool {
        self.bus.unregister_path(id)
    }

    /// Apply a batch of values.
    ///
    /// The batch is validated as a whole first; any rejection applies nothing.
    /// Changed values are persisted to the override file, then one
    /// notification per changed value is published. Returns the number of
    /// values that actually changed.
    pub async fn apply_overrides(&self, values: Vec<SettingValue>) -> Result<usize> {
        for value in &values {
            self.validate(value)?;
        }

        let changed: Vec<SettingValue> = {
            let _section = self
                .write_section
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let mut changed = Vec::new();
            for value in values {
                let current = self.values.get(&value.path).map(|v| v.value().clone());
                if current.as_deref() == Some(value.value.as_str()) {
                    continue;
                }
                self.values.insert(value.path.clone(), value.value.clone());
                changed.retain(|c: &SettingValue| c.path != value.path);
                changed.push(value);
            }
            changed
        };

        if changed.is_empty() {
            return Ok(0);
        }

        for value in &changed {
            info!(
                path = %value.path,
                value = %self.display_value(value),
                "Setting changed"
            );
        }

        self.persist().await;

        for value in &changed {
            let handlers = self.bus.send_setting(value);
            debug!(path = %value.path, handlers, "Published setting change");
        }

        Ok(changed.len())
    }

    fn validate(&self, value: &SettingValue) -> Result<()> {
        let Some(definition) = self.definitions.get(&value.path) else {
            info!(path = %value.path, "Accepting value for setting without a definition");
            return Ok(());
        };

        let reject = |reason: String| SettingsError::Rejected {
            path: value.path.clone(),
            reason,
        };

        if !definition.editable {
            return Err(reject("setting is not editable".to_string()));
        }
        if !definition.value_type.accepts(&value.value) {
            return Err(reject(format!(
                "expected a value of type {:?}",
                definition.value_type
            )));
        }
        if !definition.allowed_values.is_empty()
            && !definition.allowed_values.iter().any(|a| a == &value.value)
        {
            return Err(reject(format!(
                "value must be one of {}",
                definition.allowed_values.join(", ")
            )));
        }
        Ok(())
    }

    fn display_value<'a>(&self, value: &'a SettingValue) -> &'a str {
        match self.definitions.get(&value.path) {
            Some(d) if d.secret => REDACTED,
            _ => &value.value,
        }
    }

    /// The overlay that differs from the packaged template.
    fn overlay(&self) -> SettingsDocument {
        let mut values: Vec<SettingValue> = self
            .values
            .iter()
            .filter(|e| self.template_values.get(e.key()) != Some(e.value()))
            .map(|e| SettingValue::new(e.key().clone(), e.value().clone()))
            .collect();
        values.sort_by(|a, b| a.path.cmp(&b.path));

        let mut definitions: Vec<SettingDefinition> = self
            .definitions
            .values()
            .filter(|d| !self.template_definitions.contains(&d.path))
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.path.cmp(&b.path));

        SettingsDocument {
            definitions,
            values,
        }
    }

    /// Write the current overlay. Failures are logged; the in-memory value stands.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;

        let text = match self.overlay().to_yaml() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize setting overrides");
                return;
            }
        };

        if let Err(e) = self.source.write_overrides(&text).await {
            warn!(
                location = %self.source.describe(),
                error = %e,
                "Failed to persist setting overrides"
            );
        }
    }
}

#[cfg(test)]
mod tests;
