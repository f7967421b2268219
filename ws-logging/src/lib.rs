//! Global tracing setup for the workspace engine.
//!
//! Output goes to the console, a daily rolling file, or both. Events can be
//! narrowed to the spans carrying given field values, e.g.
//! `workspace_id:workspace1a2b` or `operation:*`.

use std::{
    collections::HashMap,
    io::{self, Write},
    path::Path,
};
use tracing::{field::Visit, span, Metadata, Subscriber};
pub use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};
use ws_config::LoggingSettings;

// Writes every buffer to both sinks.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

/// A `key:value` span field filter; the value `*` matches any value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    fn matches(&self, fields: &HashMap<String, String>) -> bool {
        fields
            .get(&self.key)
            .is_some_and(|value| self.value == "*" || value.contains(&self.value))
    }
}

/// Parse a comma separated tag list. Malformed entries are skipped.
pub fn parse_tags(tags: &str) -> Vec<Tag> {
    tags.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        // With filters configured, events outside any span are dropped.
        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| filter.matches(&all_fields))
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

fn build_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for directive in ["tokio=warn", "sqlx=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global tracing subscriber described by `settings`.
///
/// Returns the guard of the non-blocking file writer when file output is
/// enabled; dropping it flushes and stops the writer. Installing twice is a
/// no-op, so tests and embedders may call this freely.
pub fn init_subscriber(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let tag_filter_layer = TagFilterLayer {
        filters: parse_tags(&settings.tags),
    };

    let use_console = settings.output == "console" || settings.output == "both";
    let use_file = settings.output == "file" || settings.output == "both";
    let is_json = settings.format == "json";

    let subscriber = registry()
        .with(build_filter(&settings.level))
        .with(tag_filter_layer);

    let log_path: &Path = &settings.file_path;
    let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    let log_filename = log_path
        .file_name()
        .unwrap_or_else(|| "wsmaster.log".as_ref());

    let mut guard: Option<WorkerGuard> = None;

    let result = if use_console && use_file {
        let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let tee_writer = MakeTee {
            make_a: std::io::stdout,
            make_b: non_blocking,
        };
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(tee_writer);
        if is_json {
            subscriber.with(fmt_layer.json()).try_init()
        } else {
            subscriber.with(fmt_layer.pretty()).try_init()
        }
    } else if use_console {
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
        if is_json {
            subscriber.with(fmt_layer.json()).try_init()
        } else {
            subscriber.with(fmt_layer.pretty()).try_init()
        }
    } else if use_file {
        let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking);
        if is_json {
            subscriber.with(fmt_layer.json()).try_init()
        } else {
            subscriber.with(fmt_layer).try_init()
        }
    } else {
        subscriber.try_init()
    };

    if let Err(e) = result {
        tracing::debug!("Tracing subscriber already installed: {}", e);
        return None;
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("workspace_id:workspace42, operation:*,broken,:x,key:");
        assert_eq!(
            tags,
            vec![
                Tag {
                    key: "workspace_id".to_string(),
                    value: "workspace42".to_string()
                },
                Tag {
                    key: "operation".to_string(),
                    value: "*".to_string()
                },
            ]
        );
        assert!(parse_tags("").is_empty());
    }

    #[test]
    fn test_tag_matching() {
        let mut fields = HashMap::new();
        fields.insert("workspace_id".to_string(), "workspace42".to_string());

        let exact = &parse_tags("workspace_id:workspace42")[0];
        let partial = &parse_tags("workspace_id:42")[0];
        let any = &parse_tags("workspace_id:*")[0];
        let other = &parse_tags("operation:*")[0];

        assert!(exact.matches(&fields));
        assert!(partial.matches(&fields));
        assert!(any.matches(&fields));
        assert!(!other.matches(&fields));
    }

    #[test]
    fn test_init_with_file_output_returns_guard() {
        let temp = tempfile::TempDir::new().unwrap();
        let settings = LoggingSettings {
            output: "file".to_string(),
            file_path: temp.path().join("engine.log"),
            ..Default::default()
        };
        // First call installs, later calls are ignored without panicking.
        let _first = init_subscriber(&settings);
        assert!(init_subscriber(&settings).is_none());
    }
}
