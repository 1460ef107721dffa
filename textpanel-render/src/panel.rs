//! The text panel: options, declared resources and render passes behind
//! one handle.

use crate::error::RenderResult;
use crate::frame::PanelData;
use crate::host::HostServices;
use crate::options::{HostConfig, PanelOptions};
use crate::orchestrator::{RenderOrchestrator, RenderOutcome, RenderState};
use crate::partials::{MapPartials, PartialSource};
use crate::resources::{ResourceManager, ResourceSet};
use crate::rows::{frame_choices, FrameChoice};
use crate::sandbox::Diagnostic;
use std::sync::Arc;

/// A text panel: options, declared resources and the render orchestrator.
pub struct TextPanel {
    // declared first so passes are unmounted before resources are released
    orchestrator: RenderOrchestrator,
    scripts: ResourceSet,
    styles: ResourceSet,
    options: PanelOptions,
    host: HostServices,
    config: HostConfig,
    resources: Arc<ResourceManager>,
    partials: Arc<dyn PartialSource>,
}

impl TextPanel {
    pub fn new(
        options: PanelOptions,
        host: HostServices,
        config: HostConfig,
        resources: Arc<ResourceManager>,
    ) -> RenderResult<Self> {
        let partials: Arc<dyn PartialSource> = Arc::new(MapPartials::new());
        let orchestrator =
            RenderOrchestrator::new(host.clone(), config, options.sandbox)?.with_partials(partials.clone());
        Ok(Self {
            orchestrator,
            scripts: ResourceSet::new(resources.clone(), &options.scripts()),
            styles: ResourceSet::new(resources.clone(), &options.styles()),
            options,
            host,
            config,
            resources,
            partials,
        })
    }

    /// Where `contentPartials` URLs are fetched from.
    pub fn with_partials(mut self, partials: Arc<dyn PartialSource>) -> RenderResult<Self> {
        self.partials = partials;
        self.rebuild_orchestrator()?;
        Ok(self)
    }

    fn rebuild_orchestrator(&mut self) -> RenderResult<()> {
        let orchestrator = RenderOrchestrator::new(self.host.clone(), self.config, self.options.sandbox)?
            .with_partials(self.partials.clone());
        // dropping the old one unmounts it
        self.orchestrator = orchestrator;
        Ok(())
    }

    pub fn options(&self) -> &PanelOptions {
        &self.options
    }

    /// Replaces the options. New resources are registered before the old
    /// ones are released, so URLs in both are never reloaded.
    pub fn set_options(&mut self, options: PanelOptions) -> RenderResult<()> {
        let scripts = ResourceSet::new(self.resources.clone(), &options.scripts());
        let styles = ResourceSet::new(self.resources.clone(), &options.styles());
        self.scripts = scripts;
        self.styles = styles;

        let limits_changed = options.sandbox != self.options.sandbox;
        self.options = options;
        if limits_changed {
            self.rebuild_orchestrator()?;
        }
        Ok(())
    }

    /// True once every external script has loaded or failed.
    pub fn is_ready(&self) -> bool {
        self.scripts.is_loaded()
    }

    pub fn styles_loaded(&self) -> bool {
        self.styles.is_loaded()
    }

    /// Waits for external scripts (styles never gate output), then renders.
    pub async fn render(&self, data: &PanelData, frame_index: usize) -> RenderOutcome {
        self.scripts.loaded().await;
        let frame_index = frame_index.min(data.series.len().saturating_sub(1));
        self.orchestrator.render(data, frame_index, &self.options).await
    }

    pub fn state(&self) -> RenderState {
        self.orchestrator.state()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.orchestrator.diagnostics()
    }

    pub fn frame_choices(&self, data: &PanelData) -> Vec<FrameChoice> {
        frame_choices(&data.series)
    }

    pub fn unmount(&self) {
        self.orchestrator.unmount();
    }
}
