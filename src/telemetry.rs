// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::fmt::Debug;

use tracing::{Event, Subscriber, field};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber. `LOG_FORMAT=json` selects JSON output and `RUST_LOG`
/// overrides the default `info` filter.
pub fn setup_logging() {
    // A second install (tests share one process) is not an error.
    let _ = tracing_subscriber::registry().with(fmt_layer()).try_init();
}

fn json_fmt() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let format = tracing_subscriber::fmt::format().json().flatten_event(true);
    let format = tracing_subscriber::fmt::layer()
        .event_format(format)
        .fmt_fields(format::JsonFields::default());
    Box::new(format)
}

fn plain_fmt() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let format = tracing_subscriber::fmt::layer()
        .event_format(PlainFormat)
        .fmt_fields(PlainFormat);
    Box::new(format)
}

fn fmt_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let format = if env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        json_fmt()
    } else {
        plain_fmt()
    };
    Box::new(format.with_filter(env_filter()))
}

fn env_filter() -> EnvFilter {
    let directives = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    EnvFilter::builder()
        .with_regex(false)
        .parse(&directives)
        .unwrap_or_else(|e| {
            eprintln!("invalid {}={directives:?} ({e}), using {DEFAULT_FILTER}", EnvFilter::DEFAULT_ENV);
            EnvFilter::new(DEFAULT_FILTER)
        })
}

// PlainFormat writes tab separated lines: time, level, target and spans, message, then k=v fields.
struct PlainFormat;

struct Visitor<'writer> {
    res: std::fmt::Result,
    is_empty: bool,
    writer: Writer<'writer>,
}

impl Visitor<'_> {
    fn write_field(&mut self, name: &str, value: &dyn Debug) -> std::fmt::Result {
        let sep = if std::mem::replace(&mut self.is_empty, false) {
            ""
        } else {
            " "
        };
        write!(self.writer, "{sep}{name}={value:?}")
    }
}

impl field::Visit for Visitor<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        if self.res.is_err() {
            return;
        }
        self.res = match field.name() {
            "message" => write!(self.writer, "{value}\t"),
            name => {
                let sep = if std::mem::replace(&mut self.is_empty, false) {
                    ""
                } else {
                    " "
                };
                write!(self.writer, "{sep}{name}={value}")
            }
        }
    }

    fn record_debug(&mut self, field: &field::Field, val: &dyn Debug) {
        if self.res.is_err() {
            return;
        }
        self.res = match field.name() {
            "message" => write!(self.writer, "{val:?}\t"),
            name => self.write_field(name, val),
        }
    }
}

impl<'writer> FormatFields<'writer> for PlainFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        let mut visitor = Visitor {
            writer,
            res: Ok(()),
            is_empty: true,
        };
        fields.record(&mut visitor);
        visitor.res
    }
}

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        use tracing_log::NormalizeEvent;
        use tracing_subscriber::fmt::time::FormatTime;
        use tracing_subscriber::fmt::time::SystemTime;
        let normalized_meta = event.normalized_metadata();
        SystemTime.format_time(&mut writer)?;
        let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
        write!(
            writer,
            "\t{}\t",
            meta.level().to_string().to_ascii_lowercase()
        )?;

        let target = meta.target();
        let target = target.strip_prefix("podtunnel::").unwrap_or(target);
        write!(writer, "{target}")?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.metadata().name())?;
                let ext = span.extensions();
                if let Some(fields) = &ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        };
        if event.fields().any(|_| true) {
            write!(writer, "\t")?;
        }

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}
