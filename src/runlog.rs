//! Per-run log handle.
//!
//! A [`RunLog`] owns the log file of one case run. Events emitted while the
//! run's future is polled under [`RunLog::dispatch`] go to that file (all
//! levels down to DEBUG) and to stderr filtered by `RUST_LOG`. The file is
//! flushed and released when the handle drops, on every exit path.

use crate::error::Result;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn, Dispatch};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug)]
pub struct RunLog {
    file: Option<(PathBuf, Arc<File>)>,
}

impl RunLog {
    /// A handle that writes nothing; events go to the global subscriber.
    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Create `<dir>/<case>_<timestamp>.log`.
    pub fn create(dir: &Path, case_id: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
        let path = dir.join(format!("{}_{stamp}.log", slugify(case_id)));
        let file = File::create(&path)?;
        debug!("Run log opened at {}", path.display());
        Ok(Self {
            file: Some((path, Arc::new(file))),
        })
    }

    /// Open in `dir` when given, otherwise a disabled handle. Failure to
    /// create the file falls back to a disabled handle.
    pub fn open(dir: Option<&Path>, case_id: &str) -> Self {
        match dir {
            Some(dir) => Self::create(dir, case_id).unwrap_or_else(|e| {
                warn!("Could not create run log in {}: {}", dir.display(), e);
                Self::disabled()
            }),
            None => Self::disabled(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(p, _)| p.as_path())
    }

    /// Subscriber to run the case under, if this handle has a file.
    pub fn dispatch(&self) -> Option<Dispatch> {
        let (_, file) = self.file.as_ref()?;
        let file_layer = fmt::layer()
            .with_writer(file.clone())
            .with_ansi(false)
            .with_target(false)
            .with_filter(LevelFilter::DEBUG);
        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(EnvFilter::from_default_env());
        let subscriber = tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer);
        Some(Dispatch::new(subscriber))
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        if let Some((path, file)) = self.file.take() {
            if let Err(e) = (&*file).flush() {
                warn!("Failed to flush run log {}: {}", path.display(), e);
            }
        }
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if (ch.is_whitespace() || matches!(ch, '-' | '_')) && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        "case".to_string()
    } else {
        slug
    }
}
