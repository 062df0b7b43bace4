use std::{
    io::{self, Write as _},
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ringbuf::{HeapRb, Rb};
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

/// Environment variable holding the log filter, `info` when unset.
pub(crate) const LOG_ENV: &str = "IQ_RING_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr with local timestamps.
pub(crate) fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(io::stderr)
        .init();
}

/// Log into a [`Console`] keeping the last `capacity` lines, for the dashboard.
pub(crate) fn init_console_logging(capacity: usize) -> Console {
    let console = Console(Arc::new(Mutex::new(ConsoleLines::new(capacity))));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_writer(console.clone())
        .init();

    console
}

/// Complete log lines, oldest first, plus the line being written.
pub(crate) struct ConsoleLines {
    lines: HeapRb<String>,
    pending: Vec<u8>,
    echo: Option<Box<dyn io::Write + Send>>,
}

impl ConsoleLines {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: HeapRb::new(capacity.max(1)),
            pending: Vec::new(),
            echo: None,
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    /// Replay the held lines into `sink` and copy every later line there.
    pub fn echo_to(&mut self, mut sink: Box<dyn io::Write + Send>) -> io::Result<()> {
        for line in self.lines.iter() {
            writeln!(sink, "{line}")?;
        }
        sink.flush()?;
        self.echo = Some(sink);
        Ok(())
    }

    fn finish_line(&mut self) {
        let raw = mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches('\r');
        if let Some(echo) = &mut self.echo {
            // write errors are dropped, the line is still kept
            let _ = writeln!(echo, "{line}");
        }
        self.lines.push_overwrite(line.to_owned());
    }
}

impl io::Write for ConsoleLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(end) = rest.iter().position(|b| *b == b'\n') {
            self.pending.extend_from_slice(&rest[..end]);
            self.finish_line();
            rest = &rest[end + 1..];
        }
        self.pending.extend_from_slice(rest);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct Console(Arc<Mutex<ConsoleLines>>);

impl Console {
    pub fn lock(&self) -> MutexGuard<'_, ConsoleLines> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Console {
    type Writer = ConsoleWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        ConsoleWriter(self.lock())
    }
}

/// Holds the console lock for one event.
pub(crate) struct ConsoleWriter<'a>(MutexGuard<'a, ConsoleLines>);

impl io::Write for ConsoleWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
