// src/context.rs

//! Process-wide execution context.
//!
//! Everything that is shared between job handles lives here: the site
//! [`Settings`], the `qstat` view cache, and the once-per-process
//! overload warning flag. Handles normally use the process default
//! ([`RunContext::global`]); tests and embedders can construct their own and
//! pass it through job options instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::cluster::qstat::QstatCache;
use crate::errors::{Result, RunjobError};
use crate::settings::Settings;

pub struct RunContext {
    settings: Settings,
    qstat: QstatCache,
    overload_warned: AtomicBool,
}

static GLOBAL: OnceLock<Arc<RunContext>> = OnceLock::new();

impl RunContext {
    pub fn new(settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            qstat: QstatCache::new(),
            overload_warned: AtomicBool::new(false),
        })
    }

    /// Install `settings` as the process default.
    ///
    /// Fails if the default has already been created, either by an earlier
    /// call or implicitly by [`RunContext::global`].
    pub fn init_global(settings: Settings) -> Result<()> {
        let ctx = RunContext::new(settings);
        GLOBAL
            .set(ctx)
            .map_err(|_| RunjobError::Usage("global run context already initialized".to_string()))
    }

    /// The process-default context, created with default [`Settings`] on
    /// first use unless [`RunContext::init_global`] ran earlier.
    pub fn global() -> Arc<RunContext> {
        GLOBAL
            .get_or_init(|| RunContext::new(Settings::default()))
            .clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The shared `qstat` view cache. Exposed so embedders can force a
    /// refresh (e.g. after out-of-band scheduler changes).
    pub fn qstat(&self) -> &QstatCache {
        &self.qstat
    }

    /// Returns true exactly once per context; used to emit the scheduler
    /// overload warning a single time for the process lifetime.
    pub(crate) fn first_overload_warning(&self) -> bool {
        !self.overload_warned.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
