//! Diagnostic log output for the daemon, with a filter that can be
//! replaced while running.
use anyhow::Context;
use clap::ValueEnum;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

/// Replace the active filter, using `EnvFilter` directive syntax
pub fn set_diagnostic_log_filter(new_filter: &str) -> anyhow::Result<()> {
    let handle = FILTER_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("diagnostic logging has not been initialized"))?;
    let filter = EnvFilter::try_new(new_filter)
        .with_context(|| format!("parsing log filter '{new_filter}'"))?;
    handle.reload(filter).context("applying new log filter")
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig<'a> {
    /// Hourly rotated files are written here instead of stderr
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl LoggingConfig<'_> {
    fn writer(&self) -> (BoxMakeWriter, Option<WorkerGuard>) {
        match &self.log_dir {
            Some(dir) => {
                let (writer, guard) =
                    tracing_appender::non_blocking(tracing_appender::rolling::hourly(dir, "smtpd.log"));
                (BoxMakeWriter::new(writer), Some(guard))
            }
            None => (BoxMakeWriter::new(std::io::stderr), None),
        }
    }

    fn initial_filter(&self) -> anyhow::Result<EnvFilter> {
        match std::env::var(self.filter_env_var) {
            Ok(directives) => EnvFilter::try_new(&directives)
                .with_context(|| format!("parsing ${} '{directives}'", self.filter_env_var)),
            Err(_) => EnvFilter::try_new(self.default_filter)
                .with_context(|| format!("parsing default log filter '{}'", self.default_filter)),
        }
    }

    /// Install the global subscriber. Keep the returned guard alive
    /// until exit; dropping it flushes buffered file output.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let (filter, handle) = reload::Layer::new(self.initial_filter()?);
        let (writer, guard) = self.writer();

        let output = fmt::layer().with_thread_names(true).with_writer(writer);
        let output = match self.diag_format {
            DiagnosticFormat::Pretty => output.pretty().boxed(),
            DiagnosticFormat::Full => output.boxed(),
            DiagnosticFormat::Compact => output.compact().boxed(),
            DiagnosticFormat::Json => output.json().boxed(),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(output)
            .try_init()
            .context("installing diagnostic log subscriber")?;

        FILTER_HANDLE
            .set(handle)
            .map_err(|_| anyhow::anyhow!("diagnostic logging was already initialized"))?;
        Ok(guard)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reload_requires_init() {
        let err = set_diagnostic_log_filter("smtpd=debug").unwrap_err();
        assert!(err.to_string().contains("not been initialized"));
    }
}
