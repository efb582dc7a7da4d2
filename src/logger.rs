use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn session_start(&self, _target: &str, _session: &str) {}
    fn phase(&self, _target: &str, _phase: &str) {}
    fn request(&self, _method: &str) {}
    fn path_error(&self, _path: &str, _msg: &str) {}
    fn diff(&self, _added: usize, _removed: usize, _modified: usize) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _target: &str, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn session_start(&self, target: &str, session: &str) {
        self.line(&format!("START target={target} session={session}"));
    }
    fn phase(&self, target: &str, phase: &str) {
        self.line(&format!("PHASE target={target} phase={phase}"));
    }
    fn request(&self, method: &str) {
        self.line(&format!("CALL method={method}"));
    }
    fn path_error(&self, path: &str, msg: &str) {
        self.line(&format!("PATH_ERROR path={path} msg={msg}"));
    }
    fn diff(&self, added: usize, removed: usize, modified: usize) {
        self.line(&format!(
            "DIFF added={added} removed={removed} modified={modified}"
        ));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
    fn done(&self, target: &str, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE target={target} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}
