/// Result Collector - Per-Job Outcome Reporting
///
/// **Core Responsibility:**
/// Wait on a single job handle, format its outcome, and write it to the
/// local output streams.
///
/// **Reporting Rules:**
/// - exit code 0: `<label> completed success took <duration>`
/// - non-zero exit: `<label> completed failure`, then the job's captured
///   stdout and stderr forwarded verbatim to local stdout and stderr
/// - infrastructure error: `error: <trimmed message>`, counted as neither
///   pass nor fail
///
/// Each job's report is written under one lock, so concurrent waiters never
/// interleave within a report. Log events go through the same lock (the sink
/// is the subscriber's writer) and land on the err stream between reports.

use crate::client::JobHandle;
use crate::reporter::{Outcome, Reporter};
use sandrun_common::types::{JobDuration, JobResult};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use tracing_subscriber::fmt::MakeWriter;

/// Render as `{seconds}.{tenths}s`, truncating rather than rounding
pub fn format_duration(duration: &JobDuration) -> String {
    format!("{}.{}s", duration.seconds, duration.nanoseconds / 100_000_000)
}

struct Streams {
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
}

/// Serialised access to the local stdout/stderr pair
#[derive(Clone)]
pub struct OutputSink {
    streams: Arc<Mutex<Streams>>,
}

impl OutputSink {
    pub fn new(out: impl Write + Send + 'static, err: impl Write + Send + 'static) -> Self {
        Self {
            streams: Arc::new(Mutex::new(Streams {
                out: Box::new(out),
                err: Box::new(err),
            })),
        }
    }

    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    pub fn line(&self, line: &str) {
        self.report(line, &[], &[]);
    }

    /// Write one line to stdout, then forward captured streams untouched
    pub fn report(&self, line: &str, stdout: &[u8], stderr: &[u8]) {
        let written = write_report(&mut self.lock(), line, stdout, stderr);
        // Logging takes the lock again, so the guard must be gone by now
        if let Err(e) = written {
            warn!(error = %e, "Failed to write report");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Log output written to the sink's err stream, holding the sink lock
pub struct LogWriter<'a>(MutexGuard<'a, Streams>);

impl Write for LogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.err.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.err.flush()
    }
}

impl<'a> MakeWriter<'a> for OutputSink {
    type Writer = LogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(self.lock())
    }
}

fn write_report(streams: &mut Streams, line: &str, stdout: &[u8], stderr: &[u8]) -> io::Result<()> {
    writeln!(streams.out, "{}", line)?;
    streams.out.write_all(stdout)?;
    streams.out.flush()?;
    streams.err.write_all(stderr)?;
    streams.err.flush()
}

#[derive(Clone)]
pub struct ResultCollector {
    sink: OutputSink,
    reporter: Arc<Reporter>,
}

impl ResultCollector {
    pub fn new(sink: OutputSink, reporter: Arc<Reporter>) -> Self {
        Self { sink, reporter }
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    /// Block on this job's handle only, then report it
    #[instrument(skip(self, handle, timeout), fields(label = %label))]
    pub async fn await_and_report(
        &self,
        label: &str,
        handle: JobHandle,
        timeout: Option<Duration>,
    ) -> Outcome {
        let result = handle.result_within(timeout).await;
        self.report(label, &result)
    }

    pub fn report(&self, label: &str, result: &JobResult) -> Outcome {
        let outcome = match result {
            JobResult::Completed { exit_code: 0, duration, .. } => {
                debug!(label = %label, duration = %format_duration(duration), "Job passed");
                self.sink.line(&format!(
                    "{} completed success took {}",
                    label,
                    format_duration(duration)
                ));
                Outcome::Passed
            }
            JobResult::Completed { exit_code, stdout, stderr, .. } => {
                debug!(label = %label, exit_code = *exit_code, "Job failed");
                self.sink
                    .report(&format!("{} completed failure", label), stdout, stderr);
                Outcome::Failed
            }
            JobResult::Error { message } => {
                warn!(label = %label, error = %message.trim(), "Job errored");
                self.sink.line(&format!("error: {}", message.trim()));
                Outcome::Errored
            }
        };
        self.reporter.record(outcome);
        outcome
    }
}

/// In-memory stream for asserting on reported output
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn capture() -> (ResultCollector, SharedBuffer, SharedBuffer) {
    let out = SharedBuffer::default();
    let err = SharedBuffer::default();
    let sink = OutputSink::new(out.clone(), err.clone());
    (ResultCollector::new(sink, Arc::new(Reporter::new())), out, err)
}
