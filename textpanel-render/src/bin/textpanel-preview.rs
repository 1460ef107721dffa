use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;
use textpanel_render::{
    DirectoryPartials, HostConfig, HostServices, PanelData, PanelError, PanelOptions, RenderError, RenderState,
    ResourceManager, StaticDocument, TemplateVariables, TextPanel, TimeRange,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: textpanel-preview <options.yaml> <frames.json> [frame-index]");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  textpanel-preview demos/options.yaml demos/frames.json");
        eprintln!("  RUST_LOG=debug textpanel-preview demos/options.yaml demos/frames.json 1");
        process::exit(1);
    }

    let frame_index = match args.get(3).map(|s| s.parse::<usize>()) {
        None => 0,
        Some(Ok(index)) => index,
        Some(Err(_)) => {
            eprintln!("✗ frame index must be a number, got '{}'", args[3]);
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("✗ failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    let exit_code = match runtime.block_on(preview(&args[1], &args[2], frame_index)) {
        Ok(()) => 0,
        Err(e) => {
            print_error(&e);
            1
        }
    };
    process::exit(exit_code);
}

async fn preview(options_path: &str, frames_path: &str, frame_index: usize) -> Result<(), PanelError> {
    let options_text = fs::read_to_string(options_path)
        .map_err(|e| RenderError::Options(format!("Failed to read {}: {}", options_path, e)))
        .map_err(|e| PanelError::from(&e))?;
    let options = PanelOptions::from_yaml(&options_text).map_err(|e| PanelError::from(&e))?;

    let frames_text = fs::read_to_string(frames_path)
        .map_err(|e| RenderError::Options(format!("Failed to read {}: {}", frames_path, e)))
        .map_err(|e| PanelError::from(&e))?;
    let data: PanelData = serde_json::from_str(&frames_text)
        .map_err(|e| RenderError::Options(format!("Invalid frames in {}: {}", frames_path, e)))
        .map_err(|e| PanelError::from(&e))?;

    let variables = TemplateVariables::from_config(TimeRange::default(), &options.variables);
    let host = HostServices::default().with_interpolator(Arc::new(variables));

    // partial URLs resolve next to the options file
    let root = Path::new(options_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let document = Arc::new(StaticDocument::new());
    let resources = Arc::new(ResourceManager::new(document.clone()));
    let panel = TextPanel::new(options, host, HostConfig::default(), resources)
        .and_then(|panel| panel.with_partials(Arc::new(DirectoryPartials::new(root))))
        .map_err(|e| PanelError::from(&e))?;

    panel.render(&data, frame_index).await;

    for diagnostic in panel.diagnostics() {
        eprintln!("! {:?} code did not compile: {}", diagnostic.kind, diagnostic.message);
    }

    match panel.state() {
        RenderState::Rendered { results, .. } => {
            let head = document.head_html();
            if !head.is_empty() {
                println!("{}", head);
            }
            for result in results {
                println!("<div data-id=\"{}\">{}</div>", result.id, result.html);
            }
            Ok(())
        }
        RenderState::Errored { error, .. } => Err(error),
        other => Err(PanelError::from(&RenderError::Options(format!(
            "render did not finish: {:?}",
            other
        )))),
    }
}

fn print_error(error: &PanelError) {
    eprintln!("✗ {}", error.title);
    eprintln!("  {}", error.detail);
    if error.raw != error.detail {
        eprintln!();
        for line in error.raw.lines() {
            eprintln!("    {}", line);
        }
    }
}
