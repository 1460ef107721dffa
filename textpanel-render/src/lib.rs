//! # Text Panel Rendering
//!
//! Renders user-authored templates against tabular query results for a
//! dashboard text panel.
//!
//! ## Features
//! - Row projection of columnar frames, with status colors from field display
//! - Tera templates with a helper library and dashboard variable interpolation
//! - Markdown with highlighted code blocks, then allow-list sanitizing
//! - Sandboxed Luau pre/post-render code with subscribe/teardown lifecycle
//! - Generation-tagged render passes: stale passes never publish
//! - Reference-counted external scripts and stylesheets shared between panels
//!
//! ## Example
//! ```ignore
//! use std::sync::Arc;
//! use textpanel_render::{
//!     HostConfig, HostServices, PanelData, PanelOptions, ResourceManager, StaticDocument, TextPanel,
//! };
//!
//! let options = PanelOptions::from_yaml(r#"
//! content: "**{{ name }}** is {{ status }}"
//! renderMode: everyRow
//! helpers: |
//!   return context.host.event_bus.subscribe("refresh", function(payload)
//!     context.host.notify_success("refreshed")
//!   end)
//! "#)?;
//!
//! let resources = Arc::new(ResourceManager::new(Arc::new(StaticDocument::new())));
//! let panel = TextPanel::new(options, HostServices::default(), HostConfig::default(), resources)?;
//! let data: PanelData = serde_json::from_str(frames_json)?;
//! panel.render(&data, 0).await;
//! ```

pub mod dates;
pub mod engine;
pub mod error;
pub mod frame;
pub mod helpers;
pub mod host;
pub mod markdown;
pub mod options;
pub mod orchestrator;
pub mod panel;
pub mod partials;
pub mod resources;
pub mod rows;
pub mod sandbox;
pub mod sanitize;

// --- Core types ---
pub use error::{FrameError, PanelError, RenderError, RenderResult, PANEL_ERROR_TITLE};
pub use frame::{DataFrame, DisplayValue, Field, FieldType, PanelData, ThresholdStep};
pub use options::{HostConfig, PanelOptions, PartialItem, RenderMode, SandboxLimits};
pub use panel::TextPanel;
pub use rows::{FrameChoice, Record};

// --- Host services ---
pub use host::{
    EventBus, HostServices, Interpolator, LocalEventBus, LocationService, LogNotifier, MemoryLocation,
    MemoryNotifier, Notification, Notifier, TemplateVariables, TimeRange, VariableValue,
};

// --- Pipeline ---
pub use engine::{RenderEngine, RenderedHtml, TargetContext};
pub use orchestrator::{RenderOrchestrator, RenderOutcome, RenderState, RenderTarget, RenderedTarget, SourceRecords};
pub use partials::{DirectoryPartials, MapPartials, PartialSource, PARTIAL_FALLBACK};
pub use sandbox::{CodeKind, CompiledCode, Completion, Diagnostic, ScriptHost, Teardown, TeardownSet};

// --- Resources ---
pub use resources::{
    ElementHost, ElementStatus, Resource, ResourceElement, ResourceKind, ResourceManager, ResourceSet,
    StaticDocument,
};
