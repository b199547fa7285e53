/// Caller-visible progress log. Receives whole lines only.
pub trait ProgressLog: Send + Sync {
    fn line(&self, container: &str, line: &str);
}

/// Default sink: the daemon log, under a dedicated target so progress
/// output can be filtered separately from berth's own logging.
pub struct LogSink;

impl ProgressLog for LogSink {
    fn line(&self, container: &str, line: &str) {
        log::info!(target: "progress", "[{container}] {line}");
    }
}

/// Buffers arbitrary text chunks and forwards newline-delimited lines to
/// the sink. A trailing partial line is forwarded on `flush`.
pub struct LineWriter {
    sink: std::sync::Arc<dyn ProgressLog>,
    container: String,
    pending: String,
}

impl LineWriter {
    pub fn new(sink: std::sync::Arc<dyn ProgressLog>, container: impl Into<String>) -> Self {
        Self {
            sink,
            container: container.into(),
            pending: String::new(),
        }
    }

    pub fn write(&mut self, chunk: &str) {
        self.pending.push_str(chunk);
        while let Some(pos) = self.pending.find('\n') {
            let line = self.pending[..pos].trim_end_matches('\r');
            self.sink.line(&self.container, line);
            self.pending.drain(..=pos);
        }
    }

    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.sink.line(&self.container, &self.pending);
            self.pending.clear();
        }
    }
}
