use pretty_assertions::assert_eq;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use textpanel_render::{
    DataFrame, DirectoryPartials, DisplayValue, EventBus, Field, FieldType, HostConfig, HostServices, LocalEventBus,
    MapPartials, MemoryNotifier, Notification, PanelData, PanelOptions, RenderMode, RenderOrchestrator,
    RenderOutcome, RenderState, RenderedTarget, ResourceManager, SandboxLimits, SourceRecords, StaticDocument,
    TemplateVariables, TextPanel, TimeRange, PANEL_ERROR_TITLE,
};
use tracing_test::traced_test;

fn get_demo_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("demos");
    path.push(filename);
    path
}

fn names(values: &[&str]) -> PanelData {
    PanelData::new(vec![DataFrame::new(vec![Field::new(
        "name",
        FieldType::String,
        values.iter().map(|v| json!(v)).collect(),
    )])
    .unwrap()])
}

fn options(content: &str) -> PanelOptions {
    PanelOptions {
        content: content.to_string(),
        wrap: false,
        ..PanelOptions::default()
    }
}

struct Fixture {
    orchestrator: RenderOrchestrator,
    notifier: Arc<MemoryNotifier>,
    bus: Arc<LocalEventBus>,
}

fn fixture() -> Fixture {
    let notifier = Arc::new(MemoryNotifier::default());
    let bus = Arc::new(LocalEventBus::new());
    let host = HostServices::default()
        .with_notifier(notifier.clone())
        .with_event_bus(bus.clone());
    let orchestrator = RenderOrchestrator::new(host, HostConfig::default(), SandboxLimits::default()).unwrap();
    Fixture {
        orchestrator,
        notifier,
        bus,
    }
}

fn success(message: &str) -> Notification {
    Notification::Success(message.to_string())
}

fn published(state: RenderState) -> Vec<RenderedTarget> {
    match state {
        RenderState::Rendered { results, .. } => results,
        other => panic!("Expected Rendered, got {:?}", other),
    }
}

// Rendering modes

#[tokio::test]
async fn test_every_row_renders_in_order() {
    let f = fixture();
    let outcome = f
        .orchestrator
        .render(&names(&["Erik", "Natasha"]), 0, &options("{{ name }}"))
        .await;
    assert_eq!(outcome, RenderOutcome::Published);

    let results = published(f.orchestrator.state());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].html, "Erik");
    assert_eq!(results[1].html, "Natasha");
    assert_eq!(results[1].id, "row-1");
}

#[tokio::test]
async fn test_empty_frame_renders_default_content() {
    for mode in [RenderMode::EveryRow, RenderMode::AllRows, RenderMode::Data] {
        let f = fixture();
        let opts = PanelOptions {
            render_mode: mode,
            default_content: "no results".to_string(),
            ..options("{{ name }}")
        };
        f.orchestrator.render(&names(&[]), 0, &opts).await;
        let results = published(f.orchestrator.state());
        assert_eq!(results.len(), 1, "mode {:?}", mode);
        assert!(results[0].html.contains("no results"));
        assert_eq!(results[0].source, SourceRecords::None);
    }
}

#[tokio::test]
async fn test_all_rows_and_data_modes() {
    let f = fixture();
    let data = PanelData::new(vec![
        names(&["a", "b"]).series.remove(0),
        names(&["c"]).series.remove(0),
    ]);

    let all_rows = PanelOptions {
        render_mode: RenderMode::AllRows,
        ..options("{% for row in data %}{{ row.name }}{% endfor %}")
    };
    f.orchestrator.render(&data, 0, &all_rows).await;
    assert_eq!(published(f.orchestrator.state())[0].html, "ab");

    let series = PanelOptions {
        render_mode: RenderMode::Data,
        ..options("{% for frame in data %}[{% for row in frame %}{{ row.name }}{% endfor %}]{% endfor %}")
    };
    f.orchestrator.render(&data, 0, &series).await;
    let results = published(f.orchestrator.state());
    assert_eq!(results[0].html, "[ab][c]");
    assert_eq!(results[0].id, "series");
}

#[tokio::test]
async fn test_status_color_reaches_template() {
    let f = fixture();
    let field = Field::new("value", FieldType::Number, vec![json!(80), json!(90)]).with_display(|value| {
        let n = value.as_f64().unwrap_or_default();
        DisplayValue {
            text: n.to_string(),
            color: Some(if n > 80.0 { "red" } else { "green" }.to_string()),
            ..DisplayValue::default()
        }
    });
    let data = PanelData::new(vec![DataFrame::new(vec![field]).unwrap()]);
    let opts = PanelOptions {
        status: "value".to_string(),
        ..options("{{ value }}:{{ statusColor }}")
    };
    f.orchestrator.render(&data, 0, &opts).await;
    let results = published(f.orchestrator.state());
    assert_eq!(results[0].html, "80:green");
    assert_eq!(results[1].html, "90:red");
}

// Teardown lifecycle

#[tokio::test]
async fn test_previous_teardown_runs_once_before_next_pass() {
    let f = fixture();
    let mut opts = options("first");
    opts.helpers = r#"
        context.host.notify_success("setup")
        return function() context.host.notify_success("cleanup") end
    "#
    .to_string();

    f.orchestrator.render(&names(&["a"]), 0, &opts).await;
    opts.content = "second".to_string();
    f.orchestrator.render(&names(&["a"]), 0, &opts).await;

    assert_eq!(
        f.notifier.notifications(),
        vec![success("setup"), success("cleanup"), success("setup")]
    );
    assert_eq!(published(f.orchestrator.state())[0].html, "second");

    f.orchestrator.unmount();
    f.orchestrator.unmount();
    assert_eq!(
        f.notifier.notifications(),
        vec![success("setup"), success("cleanup"), success("setup"), success("cleanup")]
    );
}

#[tokio::test]
async fn test_subscriptions_do_not_pile_up() {
    let f = fixture();
    let mut opts = options("{{ name }}");
    opts.helpers = r#"
        return context.host.event_bus.subscribe("refresh", function(payload)
            context.host.notify_success(context.data.name .. " " .. payload.reason)
        end)
    "#
    .to_string();

    for _ in 0..3 {
        f.orchestrator.render(&names(&["a", "b"]), 0, &opts).await;
    }
    assert_eq!(f.bus.subscriber_count("refresh"), 2);

    f.bus.publish("refresh", &json!({"reason": "timer"}));
    let mut seen = f.notifier.notifications();
    seen.sort_by_key(|n| format!("{:?}", n));
    assert_eq!(seen, vec![success("a timer"), success("b timer")]);

    drop(f.orchestrator);
    assert_eq!(f.bus.subscriber_count("refresh"), 0);
}

#[tokio::test]
async fn test_after_render_sees_element() {
    let f = fixture();
    let mut opts = options("**{{ name }}**");
    opts.after_render = r#"
        context.host.notify_success(context.element.id .. "=" .. context.element.html)
        return function() context.host.notify_success("unmounted " .. context.element.id) end
    "#
    .to_string();

    f.orchestrator.render(&names(&["x"]), 0, &opts).await;
    assert_eq!(f.notifier.notifications(), vec![success("row-0=<strong>x</strong>")]);

    f.orchestrator.unmount();
    assert_eq!(
        f.notifier.notifications(),
        vec![success("row-0=<strong>x</strong>"), success("unmounted row-0")]
    );
}

#[tokio::test]
async fn test_pending_code_is_awaited_before_publish() {
    let f = fixture();
    let mut opts = options("{{ name }}");
    opts.helpers = r#"
        return coroutine.create(function()
            for i = 1, 3 do coroutine.yield() end
            context.host.notify_success("ready " .. context.data.name)
            return function() context.host.notify_success("done " .. context.data.name) end
        end)
    "#
    .to_string();

    let outcome = f.orchestrator.render(&names(&["a"]), 0, &opts).await;
    assert_eq!(outcome, RenderOutcome::Published);
    assert_eq!(f.notifier.notifications(), vec![success("ready a")]);

    f.orchestrator.unmount();
    assert_eq!(f.notifier.notifications(), vec![success("ready a"), success("done a")]);
}

// Failures

#[tokio::test]
async fn test_failing_row_publishes_nothing() {
    let f = fixture();
    let mut opts = options("{{ name }}");
    opts.helpers = r#"
        if context.data.name == "bad" then
            error("cannot render bad row")
        end
        return function() context.host.notify_success("cleanup " .. context.data.name) end
    "#
    .to_string();

    f.orchestrator.render(&names(&["ok"]), 0, &opts).await;
    let outcome = f.orchestrator.render(&names(&["a", "bad", "c"]), 0, &opts).await;
    assert_eq!(outcome, RenderOutcome::Errored);

    match f.orchestrator.state() {
        RenderState::Errored { generation, error } => {
            assert_eq!(generation, 2);
            assert_eq!(error.title, PANEL_ERROR_TITLE);
            assert!(error.detail.contains("cannot render bad row"));
            assert!(error.raw.contains("cannot render bad row"));
        }
        other => panic!("Expected Errored, got {:?}", other),
    }

    // previous generation first, then every teardown of the failed pass
    let mut seen = f.notifier.notifications();
    assert_eq!(seen.remove(0), success("cleanup ok"));
    seen.sort_by_key(|n| format!("{:?}", n));
    assert_eq!(seen, vec![success("cleanup a"), success("cleanup c")]);

    // nothing left installed
    f.orchestrator.unmount();
    assert_eq!(f.notifier.notifications().len(), 3);
}

#[tokio::test]
async fn test_template_error_enters_errored() {
    let f = fixture();
    let outcome = f
        .orchestrator
        .render(&names(&["a"]), 0, &options("{% for x in %}"))
        .await;
    assert_eq!(outcome, RenderOutcome::Errored);
    assert!(matches!(f.orchestrator.state(), RenderState::Errored { .. }));

    let outcome = f.orchestrator.render(&names(&["a"]), 0, &options("{{ name }}")).await;
    assert_eq!(outcome, RenderOutcome::Published);
}

#[tokio::test]
#[traced_test]
async fn test_syntax_error_in_code_still_renders() {
    let f = fixture();
    let mut opts = options("{{ name }}");
    opts.helpers = "con b = 1;".to_string();

    let outcome = f.orchestrator.render(&names(&["Erik"]), 0, &opts).await;
    assert_eq!(outcome, RenderOutcome::Published);
    assert_eq!(published(f.orchestrator.state())[0].html, "Erik");

    let diagnostics = f.orchestrator.diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].code, "con b = 1;");
    assert!(logs_contain("failed to compile panel code"));
}

// Generations

#[tokio::test]
async fn test_stale_pass_is_discarded() {
    let f = fixture();
    let mut slow = options("slow {{ name }}");
    slow.helpers = r#"
        return coroutine.create(function()
            for i = 1, 5 do coroutine.yield() end
            return function() context.host.notify_success("cleanup slow") end
        end)
    "#
    .to_string();
    let fast = options("fast {{ name }}");

    let data = names(&["a"]);
    let (first, second) = tokio::join!(
        f.orchestrator.render(&data, 0, &slow),
        f.orchestrator.render(&data, 0, &fast)
    );

    assert_eq!(first, RenderOutcome::Superseded);
    assert_eq!(second, RenderOutcome::Published);
    match f.orchestrator.state() {
        RenderState::Rendered { generation, results } => {
            assert_eq!(generation, 2);
            assert_eq!(results[0].html, "fast a");
        }
        other => panic!("Expected Rendered, got {:?}", other),
    }
    assert_eq!(f.notifier.notifications(), vec![success("cleanup slow")]);
}

#[tokio::test]
async fn test_unmount_during_pass_discards_it() {
    let f = fixture();
    let mut slow = options("{{ name }}");
    slow.helpers = r#"
        return coroutine.create(function()
            for i = 1, 10 do coroutine.yield() end
            return function() context.host.notify_success("cleanup") end
        end)
    "#
    .to_string();

    let data = names(&["a"]);
    let unmount = async {
        tokio::task::yield_now().await;
        f.orchestrator.unmount();
    };
    let (outcome, ()) = tokio::join!(f.orchestrator.render(&data, 0, &slow), unmount);

    assert_eq!(outcome, RenderOutcome::Superseded);
    assert_eq!(f.orchestrator.state(), RenderState::Idle);
    assert_eq!(f.notifier.notifications(), vec![success("cleanup")]);
}

// Host services and partials

#[tokio::test]
async fn test_variables_and_partials() {
    let variables = TemplateVariables::from_config(
        TimeRange::default(),
        &serde_yaml::from_str("env: prod\nhosts: [web1, web2]").unwrap(),
    );
    let host = HostServices::default().with_interpolator(Arc::new(variables));
    let partials = MapPartials::new().with("/p/hosts.html", r#"{% for h in variable(name="hosts") %}{{ h }};{% endfor %}"#);
    let orchestrator = RenderOrchestrator::new(host, HostConfig::default(), SandboxLimits::default())
        .unwrap()
        .with_partials(Arc::new(partials));

    let opts = PanelOptions {
        content_partials: serde_yaml::from_str(
            "- {name: hosts, url: /p/hosts.html}\n- {name: gone, url: /p/gone.html}",
        )
        .unwrap(),
        ..options(r#"{{ variableValue(name="$env") }} {% include "hosts" %} {% include "gone" %}"#)
    };
    orchestrator.render(&names(&["a"]), 0, &opts).await;
    assert_eq!(
        published(orchestrator.state())[0].html,
        "prod web1;web2; Unable to load template"
    );
}

#[tokio::test]
async fn test_demo_panel() {
    let options_path = get_demo_path("options.yaml");
    let options = PanelOptions::from_yaml(&fs::read_to_string(&options_path).unwrap()).unwrap();
    let data: PanelData = serde_json::from_str(&fs::read_to_string(get_demo_path("frames.json")).unwrap()).unwrap();

    let variables = TemplateVariables::from_config(TimeRange::default(), &options.variables);
    let document = Arc::new(StaticDocument::new());
    let resources = Arc::new(ResourceManager::new(document.clone()));
    let panel = TextPanel::new(
        options,
        HostServices::default().with_interpolator(Arc::new(variables)),
        HostConfig::default(),
        resources.clone(),
    )
    .unwrap()
    .with_partials(Arc::new(DirectoryPartials::new(get_demo_path(""))))
    .unwrap();

    assert!(panel.is_ready());
    assert_eq!(panel.render(&data, 0).await, RenderOutcome::Published);
    assert!(panel.diagnostics().is_empty());

    let results = published(panel.state());
    assert_eq!(results.len(), 3);
    assert!(results[0].html.contains("<h3>api</h3>"));
    assert!(results[0].html.contains("border-color: green"));
    assert!(results[1].html.contains("border-color: red"));
    assert!(results[1].html.contains("<em>over budget</em>"));
    assert!(results[2].html.contains("border-color: orange"));
    assert!(results[2].html.contains("eu-west, us-east"));
    assert_eq!(resources.use_count("/styles/status-board.css"), 1);

    panel.unmount();
    drop(panel);
    assert_eq!(resources.tracked_count(), 0);
    assert!(document.elements().is_empty());
}
