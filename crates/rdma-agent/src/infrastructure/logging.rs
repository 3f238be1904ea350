//! provides logging helpers

use std::fmt::{self};
use std::path::Path;

use anyhow::Context;
use chrono::SecondsFormat;
use chrono::Utc;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Target of provisioning audit events
pub const AUDIT_TARGET: &str = "audit";

/// One line per event: `<timestamp> <message> key=value ...`
struct AuditFormatter;

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message.push_str(&format!("{value:?}"));
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }
}

impl<S, N> FormatEvent<S, N> for AuditFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        write!(
            writer,
            "{} {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            visitor.message
        )?;
        for field in &visitor.fields {
            write!(writer, " {field}")?;
        }
        writeln!(writer)
    }
}

fn is_audit(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == AUDIT_TARGET
}

/// initiate the global tracing subscriber
///
/// With `audit_log_file` set, audit events go only to that daily rotated file and the
/// returned guard must be kept alive to flush it.
pub fn init(audit_log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let Some(audit_log_file) = audit_log_file else {
        utils::logging::init();
        return Ok(None);
    };

    let dir = audit_log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = audit_log_file
        .file_name()
        .and_then(|name| name.to_str())
        .context("audit log file needs a file name")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(7)
        .build(dir)
        .with_context(|| format!("failed to create audit log appender in {}", dir.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let fmt_layer = utils::logging::fmt_layer().with_filter(
        utils::logging::env_filter().and(filter::filter_fn(|metadata| !is_audit(metadata))),
    );
    let audit_layer = layer()
        .event_format(AuditFormatter)
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(is_audit));

    registry().with(fmt_layer).with(audit_layer).init();
    Ok(Some(file_guard))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[derive(Clone, Default)]
    struct Buffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_audit_layer_only_records_audit_events() {
        let buffer = Buffer::default();
        let subscriber = registry().with(
            layer()
                .event_format(AuditFormatter)
                .fmt_fields(format::DefaultFields::new())
                .with_writer(buffer.clone())
                .with_ansi(false)
                .with_filter(filter::filter_fn(is_audit)),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "audit", pod = "ml/trainer", devices = 2, "rdma devices provisioned");
            tracing::info!("not audited");
        });

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1, "only the audit event should be written");
        assert!(lines[0].ends_with("rdma devices provisioned pod=ml/trainer devices=2"));
    }
}
