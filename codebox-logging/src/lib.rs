//! Tracing subscriber setup shared by the codebox binaries.
//!
//! Output destination and format are chosen at startup from [`LoggingConfig`],
//! which is normally read from the environment.

use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry, EnvFilter};

/// Where formatted events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            "none" | "off" => LogOutput::None,
            _ => LogOutput::Console,
        }
    }

    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file_path: PathBuf,
}

impl LoggingConfig {
    /// Reads `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT` and `LOG_FILE_PATH`.
    ///
    /// `default_file` is used when `LOG_FILE_PATH` is unset, so each binary can
    /// keep its logs next to its own data directory.
    pub fn from_env(default_file: impl Into<PathBuf>) -> Self {
        let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let output = env::var("LOG_OUTPUT")
            .map(|v| LogOutput::parse(&v))
            .unwrap_or(LogOutput::Console);
        let format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let file_path = env::var("LOG_FILE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_file.into());

        Self {
            level,
            output,
            format,
            file_path,
        }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        for directive in ["tokio=warn", "hyper=warn", "sqlx=warn", "h2=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

// Writes every event to both sinks; succeeds if either one does.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let first = self.a.write(buf);
        let second = self.b.write(buf);
        first.or(second)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    a: A,
    b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.a.make_writer(),
            b: self.b.make_writer(),
        }
    }
}

fn split_log_path(path: &Path) -> (PathBuf, PathBuf) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("codebox.log"));
    (dir, file)
}

/// Installs the global subscriber.
///
/// The returned guard must be held for the lifetime of the process when file
/// output is enabled, otherwise buffered lines are lost on exit.
pub fn init_subscriber(config: &LoggingConfig) -> Option<WorkerGuard> {
    let subscriber = registry().with(config.filter());
    let json = config.format == LogFormat::Json;

    let file_writer = if config.output.file() {
        let (dir, file) = split_log_path(&config.file_path);
        let appender = tracing_appender::rolling::daily(dir, file);
        Some(tracing_appender::non_blocking(appender))
    } else {
        None
    };

    match (config.output.console(), file_writer) {
        (true, Some((file, guard))) => {
            let layer = tracing_subscriber::fmt::layer().with_writer(MakeTee {
                a: io::stdout,
                b: file,
            });
            if json {
                subscriber.with(layer.json()).init();
            } else {
                subscriber.with(layer).init();
            }
            Some(guard)
        }
        (false, Some((file, guard))) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file);
            if json {
                subscriber.with(layer.json()).init();
            } else {
                subscriber.with(layer).init();
            }
            Some(guard)
        }
        (true, None) => {
            let layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);
            if json {
                subscriber.with(layer.json()).init();
            } else {
                subscriber.with(layer).init();
            }
            None
        }
        (false, None) => {
            subscriber.init();
            None
        }
    }
}
