use std::fmt;
use std::io::Write;

use parking_lot::Mutex;

const TAG: &str = "RCL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Trace,
    Info,
    Warn,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
        }
    }
}

/// Per-request event trace writing one line per event to a caller-supplied
/// sink, shaped `[RCL] [<SEVERITY>] <message>`. `trace` lines are dropped
/// unless the verbose gate is open; write failures are swallowed (the trace
/// is diagnostics, not a contract).
pub struct TraceLog {
    verbose: bool,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl TraceLog {
    pub fn new(sink: Box<dyn Write + Send>, verbose: bool) -> Self {
        Self {
            verbose,
            sink: Mutex::new(sink),
        }
    }

    pub fn stderr(verbose: bool) -> Self {
        Self::new(Box::new(std::io::stderr()), verbose)
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log(&self, severity: Severity, message: fmt::Arguments<'_>) {
        if severity == Severity::Trace && !self.verbose {
            return;
        }
        let mut sink = self.sink.lock();
        let _ = writeln!(sink, "[{TAG}] [{}] {}", severity.as_str(), message);
    }

    pub fn trace(&self, message: fmt::Arguments<'_>) {
        self.log(Severity::Trace, message);
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        self.log(Severity::Info, message);
    }

    pub fn warn(&self, message: fmt::Arguments<'_>) {
        self.log(Severity::Warn, message);
    }
}

impl fmt::Debug for TraceLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceLog")
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}
