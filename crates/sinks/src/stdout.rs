//! Raw-output sink: one JSON line per delivered event.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use k8s_openapi::api::core::v1::Event;

pub struct RawOutput {
    out: Mutex<Box<dyn Write + Send>>,
}

impl RawOutput {
    pub fn stdout() -> Self { Self::new(Box::new(std::io::stdout())) }

    pub fn new(out: Box<dyn Write + Send>) -> Self { Self { out: Mutex::new(out) } }

    pub fn write_event(&self, ev: &Event) -> std::io::Result<()> {
        let line = serde_json::to_string(ev)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{}", line)?;
        out.flush()
    }
}
