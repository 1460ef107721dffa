//! Render passes: target selection, concurrent rendering, teardown
//! bookkeeping and last-writer-wins publishing.

use crate::engine::{RenderEngine, TargetContext};
use crate::error::{PanelError, RenderError, RenderResult};
use crate::frame::PanelData;
use crate::host::HostServices;
use crate::options::{HostConfig, PanelOptions, RenderMode, SandboxLimits};
use crate::partials::{fetch_partials, MapPartials, PartialSource};
use crate::rows::{project_rows, project_series, select_frame, Record};
use crate::sandbox::{CodeKind, CompiledCode, Diagnostic, ElementInfo, SandboxContext, ScriptHost, TeardownSet};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One unit of output in a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderTarget {
    /// No active frame or no rows: default content against `{}`.
    Default,
    Row(usize, Record),
    AllRows(Vec<Record>),
    Series(Vec<Vec<Record>>),
}

impl RenderTarget {
    /// Stable identity for host-side placement.
    pub fn id(&self) -> String {
        match self {
            RenderTarget::Default => "default".to_string(),
            RenderTarget::Row(index, _) => format!("row-{}", index),
            RenderTarget::AllRows(_) => "rows".to_string(),
            RenderTarget::Series(_) => "series".to_string(),
        }
    }

    pub fn data(&self) -> Value {
        match self {
            RenderTarget::Default => json!({}),
            RenderTarget::Row(_, record) => record.to_value(),
            RenderTarget::AllRows(records) => json!({ "data": records }),
            RenderTarget::Series(series) => json!({ "data": series }),
        }
    }

    fn template<'a>(&self, options: &'a PanelOptions) -> &'a str {
        match self {
            RenderTarget::Default => &options.default_content,
            _ => &options.content,
        }
    }

    fn source(&self) -> SourceRecords {
        match self {
            RenderTarget::Default => SourceRecords::None,
            RenderTarget::Row(_, record) => SourceRecords::Row(record.clone()),
            RenderTarget::AllRows(records) => SourceRecords::Rows(records.clone()),
            RenderTarget::Series(series) => SourceRecords::Series(series.clone()),
        }
    }
}

/// The records a published output was rendered from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SourceRecords {
    None,
    Row(Record),
    Rows(Vec<Record>),
    Series(Vec<Vec<Record>>),
}

/// Published output of one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedTarget {
    pub id: String,
    pub html: String,
    pub source: SourceRecords,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderState {
    Idle,
    Rendering {
        generation: u64,
    },
    Rendered {
        generation: u64,
        results: Vec<RenderedTarget>,
    },
    Errored {
        generation: u64,
        error: PanelError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Published,
    Errored,
    /// A newer pass started or the orchestrator was unmounted.
    Superseded,
}

/// Picks the targets of a pass.
pub fn build_targets(data: &PanelData, frame_index: usize, options: &PanelOptions) -> Vec<RenderTarget> {
    let status = options.status_field();
    let frame = match select_frame(options.render_mode, frame_index, &data.series) {
        Some(frame) if !frame.is_empty() => frame,
        _ => return vec![RenderTarget::Default],
    };

    match options.render_mode {
        RenderMode::EveryRow => project_rows(frame, status)
            .into_iter()
            .enumerate()
            .map(|(index, record)| RenderTarget::Row(index, record))
            .collect(),
        RenderMode::AllRows => vec![RenderTarget::AllRows(project_rows(frame, status))],
        RenderMode::Data => vec![RenderTarget::Series(project_series(&data.series, status))],
    }
}

/// Inputs shared by every target of one pass.
struct Pass<'a> {
    options: &'a PanelOptions,
    engine: RenderEngine,
    before: CompiledCode,
    after: CompiledCode,
    partials: Vec<(String, String)>,
    data_frame: Value,
    panel_data: Value,
}

pub struct RenderOrchestrator {
    generation: AtomicU64,
    state: Mutex<RenderState>,
    /// Teardown of the last published pass.
    installed: Mutex<Option<TeardownSet>>,
    host: HostServices,
    config: HostConfig,
    partials: Arc<dyn PartialSource>,
    scripts: ScriptHost,
}

impl RenderOrchestrator {
    pub fn new(host: HostServices, config: HostConfig, limits: SandboxLimits) -> RenderResult<Self> {
        Ok(Self {
            generation: AtomicU64::new(0),
            state: Mutex::new(RenderState::Idle),
            installed: Mutex::new(None),
            host,
            config,
            partials: Arc::new(MapPartials::new()),
            scripts: ScriptHost::new(limits)?,
        })
    }

    pub fn with_partials(mut self, partials: Arc<dyn PartialSource>) -> Self {
        self.partials = partials;
        self
    }

    pub fn state(&self) -> RenderState {
        self.state.lock().unwrap().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Compile diagnostics of the latest pass.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.scripts.diagnostics()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Runs one render pass and publishes it unless a newer pass started
    /// in the meantime.
    pub async fn render(&self, data: &PanelData, frame_index: usize, options: &PanelOptions) -> RenderOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock().unwrap() = RenderState::Rendering { generation };

        // previous teardown strictly before any side effect of this pass
        let previous = self.installed.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.run();
        }

        self.scripts.clear_diagnostics();
        let active_frame = select_frame(options.render_mode, frame_index, &data.series);
        let pass = Pass {
            options,
            engine: RenderEngine::new(self.host.clone(), self.config, options.wrap),
            before: self.scripts.compile(CodeKind::BeforeRender, &options.helpers),
            after: self.scripts.compile(CodeKind::AfterRender, &options.after_render),
            partials: fetch_partials(self.partials.as_ref(), &options.content_partials).await,
            data_frame: active_frame
                .and_then(|frame| serde_json::to_value(frame).ok())
                .unwrap_or(Value::Null),
            panel_data: serde_json::to_value(&data.series).unwrap_or(Value::Null),
        };

        let targets = build_targets(data, frame_index, options);
        tracing::debug!(generation, targets = targets.len(), "render pass started");

        let outputs =
            futures::future::join_all(targets.iter().map(|target| self.render_target(&pass, target))).await;

        let mut teardowns = TeardownSet::new();
        let mut results = Vec::with_capacity(outputs.len());
        let mut failure: Option<RenderError> = None;
        for (target_teardowns, result) in outputs {
            teardowns.append(target_teardowns);
            match result {
                Ok(rendered) => results.push(rendered),
                Err(err) if failure.is_none() => failure = Some(err),
                Err(_) => {}
            }
        }

        if !self.is_current(generation) {
            tracing::warn!(generation, "render pass superseded, discarding output");
            teardowns.run();
            return RenderOutcome::Superseded;
        }

        if let Some(err) = failure {
            tracing::error!(generation, error = %err, "render pass failed");
            teardowns.run();
            *self.state.lock().unwrap() = RenderState::Errored {
                generation,
                error: PanelError::from(&err),
            };
            return RenderOutcome::Errored;
        }

        tracing::info!(generation, targets = results.len(), "render pass published");
        *self.installed.lock().unwrap() = Some(teardowns);
        *self.state.lock().unwrap() = RenderState::Rendered { generation, results };
        RenderOutcome::Published
    }

    /// Renders one target. Teardowns collected so far are handed back even
    /// when the target fails, so the pass can run them.
    async fn render_target(&self, pass: &Pass<'_>, target: &RenderTarget) -> (TeardownSet, RenderResult<RenderedTarget>) {
        let mut teardowns = TeardownSet::new();
        let result = self.render_target_into(pass, target, &mut teardowns).await;
        (teardowns, result)
    }

    async fn render_target_into(
        &self,
        pass: &Pass<'_>,
        target: &RenderTarget,
        teardowns: &mut TeardownSet,
    ) -> RenderResult<RenderedTarget> {
        let data = target.data();
        let context = TargetContext {
            data: &data,
            data_frame: &pass.data_frame,
            panel_data: &pass.panel_data,
        };

        let rendered = pass
            .engine
            .render(
                &self.scripts,
                &context,
                target.template(pass.options),
                &pass.before,
                &pass.partials,
            )
            .await?;
        teardowns.push(rendered.teardown);

        let id = target.id();
        let completion = pass.after.call(
            &self.scripts,
            &SandboxContext {
                data: &data,
                data_frame: &pass.data_frame,
                panel_data: &pass.panel_data,
                host: &self.host,
                element: Some(ElementInfo {
                    id: id.clone(),
                    html: rendered.html.clone(),
                }),
                registrations: None,
                wrap: pass.options.wrap,
            },
        )?;
        teardowns.push(completion.settle().await?);

        Ok(RenderedTarget {
            id,
            html: rendered.html,
            source: target.source(),
        })
    }

    /// Makes in-flight passes stale and runs the installed teardown.
    pub fn unmount(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let installed = self.installed.lock().unwrap().take();
        if let Some(installed) = installed {
            installed.run();
        }
        *self.state.lock().unwrap() = RenderState::Idle;
        tracing::debug!(generation, "orchestrator unmounted");
    }
}

impl Drop for RenderOrchestrator {
    fn drop(&mut self) {
        self.unmount();
    }
}
