//! Template, markdown and sanitizer composed into one HTML output.

use crate::error::RenderResult;
use crate::helpers;
use crate::host::HostServices;
use crate::markdown;
use crate::options::HostConfig;
use crate::sanitize;
use crate::sandbox::{CompiledCode, HelperRegistrations, SandboxContext, ScriptHost, Teardown};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tera::{Context, Tera};

/// Name of the user template inside the per-call tera instance. The
/// `.html` extension turns on autoescaping.
const CONTENT_TEMPLATE: &str = "content.html";

/// Values one target is rendered against.
#[derive(Debug, Clone, Copy)]
pub struct TargetContext<'a> {
    pub data: &'a Value,
    pub data_frame: &'a Value,
    pub panel_data: &'a Value,
}

#[derive(Debug)]
pub struct RenderedHtml {
    pub html: String,
    pub teardown: Option<Teardown>,
}

pub struct RenderEngine {
    host: HostServices,
    config: HostConfig,
    wrap: bool,
}

impl RenderEngine {
    pub fn new(host: HostServices, config: HostConfig, wrap: bool) -> Self {
        Self { host, config, wrap }
    }

    pub fn host(&self) -> &HostServices {
        &self.host
    }

    pub fn wrap(&self) -> bool {
        self.wrap
    }

    /// Runs pre-render `code`, then renders `template`. A teardown from the
    /// code is returned with the HTML, or run before a template error is
    /// returned.
    pub async fn render(
        &self,
        scripts: &ScriptHost,
        context: &TargetContext<'_>,
        template: &str,
        code: &CompiledCode,
        partials: &[(String, String)],
    ) -> RenderResult<RenderedHtml> {
        let registrations = Arc::new(Mutex::new(HelperRegistrations::default()));
        let completion = code.call(
            scripts,
            &SandboxContext {
                data: context.data,
                data_frame: context.data_frame,
                panel_data: context.panel_data,
                host: &self.host,
                element: None,
                registrations: Some(registrations.clone()),
                wrap: self.wrap,
            },
        )?;
        let teardown = completion.settle().await?;

        let registered = std::mem::take(&mut *registrations.lock().unwrap());
        let registrations = HelperRegistrations {
            partials: partials.iter().cloned().chain(registered.partials).collect(),
            globals: registered.globals,
        };

        match self.compose_html(context, template, &registrations) {
            Ok(html) => Ok(RenderedHtml { html, teardown }),
            Err(err) => {
                if let Some(teardown) = teardown {
                    teardown.run();
                }
                Err(err)
            }
        }
    }

    /// Template, markdown and sanitizer. Never suspends.
    pub fn compose_html(
        &self,
        context: &TargetContext<'_>,
        template: &str,
        registrations: &HelperRegistrations,
    ) -> RenderResult<String> {
        let mut tera = Tera::default();
        helpers::register_helpers(&mut tera, self.host.interpolator.clone());
        tera.add_raw_templates(
            registrations
                .partials
                .iter()
                .map(|(name, content)| (name.as_str(), content.as_str())),
        )?;
        tera.add_raw_template(CONTENT_TEMPLATE, template)?;

        let mut ctx = Context::from_value(context.data.clone())?;
        for (name, value) in &registrations.globals {
            ctx.insert(name.as_str(), value);
        }

        let text = tera.render(CONTENT_TEMPLATE, &ctx)?;
        let html = markdown::render_markdown(&text, self.wrap);

        if self.config.disable_sanitize_html {
            Ok(html)
        } else {
            Ok(sanitize::sanitize_html(&html))
        }
    }
}
