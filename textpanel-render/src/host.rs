//! Services the host application exposes to templates and sandboxed code.

use crate::dates;
use chrono::{DateTime, Duration, Utc};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Value of a dashboard variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Single(String),
    Multi(Vec<String>),
}

impl VariableValue {
    pub fn values(&self) -> Vec<String> {
        match self {
            VariableValue::Single(v) => vec![v.clone()],
            VariableValue::Multi(vs) => vs.clone(),
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Single(v) => f.write_str(v),
            VariableValue::Multi(vs) => f.write_str(&vs.join(",")),
        }
    }
}

/// String-oriented variable interpolation.
///
/// `interpolate` hands every matched variable to `format` together with the
/// expression it was written as (`name` or `name:format`), and splices the
/// returned string into the output.
pub trait Interpolator: Send + Sync {
    fn interpolate(&self, text: &str, format: &mut dyn FnMut(&str, &VariableValue) -> String) -> String;

    fn replace_variables(&self, text: &str) -> String {
        self.interpolate(text, &mut |_, value| value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The last `hours` hours up to now.
    pub fn last_hours(hours: i64) -> Self {
        let to = Utc::now();
        Self {
            from: to - Duration::hours(hours),
            to,
        }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::last_hours(6)
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z0-9_.]+)(?::([^}]*))?\}|\$([A-Za-z0-9_]+)")
            .expect("variable pattern is valid")
    })
}

/// In-memory dashboard variables plus the `__from`/`__to` built-ins.
#[derive(Debug, Clone, Default)]
pub struct TemplateVariables {
    values: BTreeMap<String, VariableValue>,
    time_range: TimeRange,
}

impl TemplateVariables {
    pub fn new(time_range: TimeRange) -> Self {
        Self {
            values: BTreeMap::new(),
            time_range,
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: VariableValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: VariableValue) {
        self.values.insert(name.into(), value);
    }

    /// Builds variables from loosely-typed config values: sequences become
    /// multi-value variables, everything else a single value.
    pub fn from_config(time_range: TimeRange, config: &BTreeMap<String, serde_yaml::Value>) -> Self {
        let mut variables = Self::new(time_range);
        for (name, value) in config {
            let value = match value {
                serde_yaml::Value::Sequence(items) => {
                    VariableValue::Multi(items.iter().map(yaml_scalar).collect())
                }
                other => VariableValue::Single(yaml_scalar(other)),
            };
            variables.set(name.clone(), value);
        }
        variables
    }

    fn lookup(&self, name: &str) -> Option<VariableValue> {
        match name {
            "__from" => Some(VariableValue::Single(
                self.time_range.from.timestamp_millis().to_string(),
            )),
            "__to" => Some(VariableValue::Single(
                self.time_range.to.timestamp_millis().to_string(),
            )),
            _ => self.values.get(name).cloned(),
        }
    }
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

impl Interpolator for TemplateVariables {
    fn interpolate(&self, text: &str, format: &mut dyn FnMut(&str, &VariableValue) -> String) -> String {
        variable_pattern()
            .replace_all(text, |caps: &Captures| {
                let (name, fmt_spec) = match caps.get(3) {
                    Some(simple) => (simple.as_str(), None),
                    None => (&caps[1], caps.get(2).map(|m| m.as_str())),
                };
                let Some(mut value) = self.lookup(name) else {
                    return caps[0].to_string();
                };
                if let (Some(spec), VariableValue::Single(raw)) = (fmt_spec, &value) {
                    if let Some(formatted) = dates::format_variable_date(spec, raw) {
                        value = VariableValue::Single(formatted);
                    }
                }
                let expression = match fmt_spec {
                    Some(spec) => format!("{}:{}", name, spec),
                    None => name.to_string(),
                };
                format(&expression, &value)
            })
            .into_owned()
    }
}

pub type EventHandler = Arc<dyn Fn(&Value)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Publish/subscribe channel shared between panels of a dashboard.
pub trait EventBus {
    fn publish(&self, event_type: &str, payload: &Value);
    fn subscribe(&self, event_type: &str, handler: EventHandler) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

#[derive(Default)]
pub struct LocalEventBus {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(SubscriptionId, EventHandler)>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.handlers
            .lock()
            .unwrap()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl EventBus for LocalEventBus {
    fn publish(&self, event_type: &str, payload: &Value) {
        // handlers may subscribe or unsubscribe while running
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .unwrap()
            .get(event_type)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(payload);
        }
    }

    fn subscribe(&self, event_type: &str, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap()
            .entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut handlers = self.handlers.lock().unwrap();
        for list in handlers.values_mut() {
            list.retain(|(sid, _)| *sid != id);
        }
        handlers.retain(|_, list| !list.is_empty());
    }
}

/// Success/error toasts.
pub trait Notifier {
    fn notify_success(&self, message: &str);
    fn notify_error(&self, message: &str);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_success(&self, message: &str) {
        tracing::info!(message, "panel notification");
    }

    fn notify_error(&self, message: &str) {
        tracing::error!(message, "panel notification");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Success(String),
    Error(String),
}

#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify_success(&self, message: &str) {
        self.sent
            .lock()
            .unwrap()
            .push(Notification::Success(message.to_string()));
    }

    fn notify_error(&self, message: &str) {
        self.sent
            .lock()
            .unwrap()
            .push(Notification::Error(message.to_string()));
    }
}

/// Navigation within the host application.
pub trait LocationService {
    fn path(&self) -> String;
    fn push(&self, path: &str);
    /// Merges `query` into the current query string.
    fn partial(&self, query: &BTreeMap<String, String>);
}

#[derive(Default)]
pub struct MemoryLocation {
    path: Mutex<String>,
    query: Mutex<BTreeMap<String, String>>,
}

impl MemoryLocation {
    pub fn query(&self) -> BTreeMap<String, String> {
        self.query.lock().unwrap().clone()
    }
}

impl LocationService for MemoryLocation {
    fn path(&self) -> String {
        self.path.lock().unwrap().clone()
    }

    fn push(&self, path: &str) {
        *self.path.lock().unwrap() = path.to_string();
    }

    fn partial(&self, query: &BTreeMap<String, String>) {
        self.query
            .lock()
            .unwrap()
            .extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Everything the host lends to one panel. Read-only from the panel's side.
#[derive(Clone)]
pub struct HostServices {
    pub interpolator: Arc<dyn Interpolator>,
    pub event_bus: Arc<dyn EventBus>,
    pub notifier: Arc<dyn Notifier>,
    pub location: Arc<dyn LocationService>,
    pub locale: String,
    pub time_zone: String,
    pub time_range: TimeRange,
}

impl Default for HostServices {
    fn default() -> Self {
        let time_range = TimeRange::default();
        Self {
            interpolator: Arc::new(TemplateVariables::new(time_range)),
            event_bus: Arc::new(LocalEventBus::new()),
            notifier: Arc::new(LogNotifier),
            location: Arc::new(MemoryLocation::default()),
            locale: "en-US".to_string(),
            time_zone: "browser".to_string(),
            time_range,
        }
    }
}

impl HostServices {
    pub fn with_interpolator(mut self, interpolator: Arc<dyn Interpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_location(mut self, location: Arc<dyn LocationService>) -> Self {
        self.location = location;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn variables() -> TemplateVariables {
        let from = dates::from_millis(1_675_333_230_456).unwrap();
        let to = dates::from_millis(1_675_336_830_456).unwrap();
        TemplateVariables::new(TimeRange::new(from, to))
            .with("env", VariableValue::Single("prod".to_string()))
            .with(
                "hosts",
                VariableValue::Multi(vec!["a".to_string(), "b".to_string()]),
            )
    }

    #[test]
    fn test_replace_variables() {
        let vars = variables();
        assert_eq!(vars.replace_variables("env=$env"), "env=prod");
        assert_eq!(vars.replace_variables("${hosts}"), "a,b");
        assert_eq!(vars.replace_variables("$missing stays"), "$missing stays");
    }

    #[test]
    fn test_interpolate_collects_multi_values() {
        let vars = variables();
        let mut collected = Vec::new();
        vars.interpolate("$hosts", &mut |_, value| {
            collected.extend(value.values());
            String::new()
        });
        assert_eq!(collected, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_time_range_variables() {
        let vars = variables();
        assert_eq!(vars.replace_variables("$__from"), "1675333230456");
        assert_eq!(
            vars.replace_variables("${__from:date:iso}"),
            "2023-02-02T10:20:30.456Z"
        );
        assert_eq!(vars.replace_variables("${__to:date:seconds}"), "1675336830");
        assert_eq!(vars.replace_variables("${__to:date:YYYY-MM-DD HH}"), "2023-02-02 11");
    }

    #[test]
    fn test_variables_from_config() {
        let config: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str("env: prod\nhosts: [a, b]\nport: 8080").unwrap();
        let vars = TemplateVariables::from_config(TimeRange::default(), &config);
        assert_eq!(vars.replace_variables("$env:$port"), "prod:8080");
        assert_eq!(vars.replace_variables("$hosts"), "a,b");
    }

    #[test]
    fn test_event_bus_subscribe_and_unsubscribe() {
        let bus = LocalEventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.subscribe(
            "refresh",
            Arc::new(move |payload: &Value| sink.borrow_mut().push(payload.clone())),
        );
        bus.publish("refresh", &Value::from(1));
        bus.publish("other", &Value::from(2));
        bus.unsubscribe(id);
        bus.publish("refresh", &Value::from(3));
        assert_eq!(*seen.borrow(), vec![Value::from(1)]);
        assert_eq!(bus.subscriber_count("refresh"), 0);
    }

    #[test]
    fn test_memory_location_partial() {
        let location = MemoryLocation::default();
        location.push("/d/abc");
        let mut query = BTreeMap::new();
        query.insert("var-env".to_string(), "prod".to_string());
        location.partial(&query);
        assert_eq!(location.path(), "/d/abc");
        assert_eq!(location.query().get("var-env").map(String::as_str), Some("prod"));
    }
}
