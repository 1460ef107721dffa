use crate::error::RenderResult;
use crate::resources::{Resource, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_CONTENT: &str = "```json\n{{ __tera_context | safe }}\n```";
pub const DEFAULT_EMPTY_CONTENT: &str = "The query didn't return any results.";

/// Luau heap limit for one panel's script host.
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// Interrupt ticks allowed for one call into sandboxed code.
pub const DEFAULT_INSTRUCTION_BUDGET: u64 = 1_000_000;

/// How many times the template is rendered per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderMode {
    /// Once per row of the selected frame.
    #[default]
    EveryRow,
    /// Once for all rows of the selected frame.
    AllRows,
    /// Once for every frame of the result set.
    Data,
}

/// A named template fetched from `url` and made available to `{% include %}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialItem {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxLimits {
    pub memory_limit_bytes: usize,
    pub instruction_budget: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
        }
    }
}

/// Panel configuration, owned by the host and read on every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PanelOptions {
    pub content: String,
    pub default_content: String,
    /// Code run before the template is compiled.
    pub helpers: String,
    /// Code run once the HTML of a target exists.
    pub after_render: String,
    pub render_mode: RenderMode,
    /// Field whose display color becomes `statusColor`.
    pub status: String,
    pub wrap: bool,
    pub external_scripts: Vec<String>,
    pub external_styles: Vec<String>,
    pub content_partials: Vec<PartialItem>,
    pub sandbox: SandboxLimits,
    /// Dashboard variables, used by hosts without their own interpolation.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_yaml::Value>,
}

impl Default for PanelOptions {
    fn default() -> Self {
        Self {
            content: DEFAULT_CONTENT.to_string(),
            default_content: DEFAULT_EMPTY_CONTENT.to_string(),
            helpers: String::new(),
            after_render: String::new(),
            render_mode: RenderMode::default(),
            status: String::new(),
            wrap: true,
            external_scripts: Vec::new(),
            external_styles: Vec::new(),
            content_partials: Vec::new(),
            sandbox: SandboxLimits::default(),
            variables: BTreeMap::new(),
        }
    }
}

impl PanelOptions {
    /// Parses options from YAML (or JSON, which is valid YAML).
    pub fn from_yaml(text: &str) -> RenderResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn status_field(&self) -> Option<&str> {
        let status = self.status.trim();
        (!status.is_empty()).then_some(status)
    }

    pub fn scripts(&self) -> Vec<Resource> {
        self.external_scripts
            .iter()
            .map(|url| Resource::new(url.clone(), ResourceKind::Script))
            .collect()
    }

    pub fn styles(&self) -> Vec<Resource> {
        self.external_styles
            .iter()
            .map(|url| Resource::new(url.clone(), ResourceKind::Style))
            .collect()
    }
}

/// Settings owned by the host application rather than the panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub disable_sanitize_html: bool,
}
