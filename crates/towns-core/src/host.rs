//! What the core needs from the process hosting it

use crate::database::Database;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Process-wide "core data is ready" state.
///
/// Written by whoever drives loading (the host's load cycle or a running
/// migration); read by everyone else.
#[derive(Debug, Default)]
pub struct LoadedFlag {
    loaded: AtomicBool,
}

impl LoadedFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Severe,
}

/// Host collaborator interface
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Run `task` off the caller's path
    fn run_async(&self, task: BoxFuture<'static, ()>);

    /// Re-initialize the storage backend and repopulate every cache
    async fn reload(&self);

    fn loaded_flag(&self) -> &LoadedFlag;

    /// The storage backend currently in use
    fn database(&self) -> Arc<dyn Database>;

    fn set_loaded(&self, loaded: bool) {
        self.loaded_flag().set(loaded);
    }

    fn is_loaded(&self) -> bool {
        self.loaded_flag().get()
    }

    fn log(
        &self,
        level: LogLevel,
        message: &str,
        cause: Option<&(dyn std::error::Error + 'static)>,
    ) {
        let cause = cause.map(error_chain);
        match (level, cause) {
            (LogLevel::Info, None) => info!("{}", message),
            (LogLevel::Info, Some(cause)) => info!("{}: {}", message, cause),
            (LogLevel::Warning, None) => warn!("{}", message),
            (LogLevel::Warning, Some(cause)) => warn!("{}: {}", message, cause),
            (LogLevel::Severe, None) => error!("{}", message),
            (LogLevel::Severe, Some(cause)) => error!("{}: {}", message, cause),
        }
    }
}

/// Render an error and all of its sources as `outer: inner: root`
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        rendered.push_str(": ");
        rendered.push_str(&inner.to_string());
        source = inner.source();
    }
    rendered
}
