//! Browser sessions - one engine, one isolated context per profile

use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::mock::{Responder, RouteRegistry, RuleId};
use crate::page::{ContextHandle, Engine, EngineLauncher, Observation, ObservationLog, PageHandle};
use crate::profile::Profile;

/// A browsing context bound to one profile. Owns its storage, its mock
/// registry and its observation log; nothing here is shared with siblings.
pub struct SessionContext {
    profile: Profile,
    handle: Arc<dyn ContextHandle>,
    routes: Arc<RouteRegistry>,
    observations: ObservationLog,
    /// Patterns the engine already forwards to `routes`
    intercepted: tokio::sync::Mutex<HashSet<String>>,
}

impl SessionContext {
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn observations(&self) -> &ObservationLog {
        &self.observations
    }

    pub async fn new_page(&self) -> E2eResult<Arc<dyn PageHandle>> {
        debug!("Opening page in context '{}'", self.profile.name);
        self.handle.new_page().await
    }

    /// Serve requests matching `pattern` from `responder`
    pub async fn install_mock(&self, pattern: &str, responder: Responder) -> E2eResult<RuleId> {
        let id = self.routes.install(pattern, responder)?;
        if let Err(e) = self.ensure_intercepted(pattern).await {
            self.routes.remove(pattern);
            return Err(e);
        }
        Ok(id)
    }

    /// Swap the rule for `pattern` in one step; requests never see both or neither.
    pub async fn replace_mock(&self, pattern: &str, responder: Responder) -> E2eResult<RuleId> {
        self.ensure_intercepted(pattern).await?;
        self.routes.replace(pattern, responder)
    }

    /// Deactivate the rule for `pattern`. A guarded endpoint stays guarded.
    pub fn remove_mock(&self, pattern: &str) -> Option<RuleId> {
        self.routes.remove(pattern)
    }

    async fn ensure_intercepted(&self, pattern: &str) -> E2eResult<()> {
        let mut intercepted = self.intercepted.lock().await;
        if intercepted.contains(pattern) {
            return Ok(());
        }
        self.handle.intercept(pattern).await?;
        intercepted.insert(pattern.to_string());
        Ok(())
    }
}

pub struct Session {
    engine: Arc<dyn Engine>,
    contexts: Vec<SessionContext>,
    disposed: AtomicBool,
}

impl Session {
    /// Launch an engine and open one context per profile. Requests to
    /// `guarded` patterns are intercepted from the start in every context.
    ///
    /// A launch failure is an [`E2eError::Environment`] and is not retried.
    pub async fn create(
        launcher: &dyn EngineLauncher,
        profiles: &[Profile],
        guarded: &[String],
    ) -> E2eResult<Self> {
        if profiles.is_empty() {
            return Err(E2eError::SpecParse("a session needs at least one profile".to_string()));
        }

        let engine = launcher.launch().await?;
        let mut contexts = Vec::with_capacity(profiles.len());

        for profile in profiles {
            match open_context(engine.as_ref(), profile, guarded).await {
                Ok(context) => contexts.push(context),
                Err(e) => {
                    warn!("Context for '{}' failed: {}; tearing session down", profile.name, e);
                    let partial = Session {
                        engine,
                        contexts,
                        disposed: AtomicBool::new(false),
                    };
                    if let Err(cleanup) = partial.dispose().await {
                        warn!("Cleanup after failed session creation: {}", cleanup);
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "Session ready with {} context(s): {}",
            contexts.len(),
            profiles.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(Session {
            engine,
            contexts,
            disposed: AtomicBool::new(false),
        })
    }

    /// Run `f` with a fresh session and dispose it afterwards, whatever `f` returned.
    pub async fn scoped<T, F>(
        launcher: &dyn EngineLauncher,
        profiles: &[Profile],
        guarded: &[String],
        f: F,
    ) -> E2eResult<T>
    where
        F: for<'a> FnOnce(&'a Session) -> BoxFuture<'a, E2eResult<T>>,
    {
        let session = Session::create(launcher, profiles, guarded).await?;
        let result = f(&session).await;
        let disposed = session.dispose().await;
        match (result, disposed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!("Session cleanup failed after error: {}", cleanup);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    pub fn context(&self, index: usize) -> E2eResult<&SessionContext> {
        self.contexts.get(index).ok_or_else(|| {
            E2eError::SpecParse(format!(
                "context {} does not exist; the session has {}",
                index,
                self.contexts.len()
            ))
        })
    }

    pub fn contexts(&self) -> &[SessionContext] {
        &self.contexts
    }

    /// Console output and page errors from every context, in context order
    pub fn observations(&self) -> Vec<Observation> {
        self.contexts
            .iter()
            .flat_map(|c| c.observations.snapshot())
            .collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Close every context and the engine. Later calls do nothing.
    pub async fn dispose(&self) -> E2eResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_error = None;
        for context in &self.contexts {
            if let Err(e) = context.handle.close().await {
                warn!("Closing context '{}' failed: {}", context.profile.name, e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.engine.shutdown().await {
            warn!("Engine shutdown failed: {}", e);
            first_error.get_or_insert(e);
        }

        info!("Session disposed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            warn!("Session dropped without dispose; relying on process cleanup");
        }
    }
}

async fn open_context(engine: &dyn Engine, profile: &Profile, guarded: &[String]) -> E2eResult<SessionContext> {
    let routes = Arc::new(RouteRegistry::new(guarded)?);
    let observations = ObservationLog::new();
    let handle = engine
        .new_context(profile, routes.clone(), observations.clone())
        .await?;

    let mut intercepted = HashSet::new();
    for pattern in guarded {
        if let Err(e) = handle.intercept(pattern).await {
            let _ = handle.close().await;
            return Err(e);
        }
        intercepted.insert(pattern.clone());
    }

    Ok(SessionContext {
        profile: profile.clone(),
        handle,
        routes,
        observations,
        intercepted: tokio::sync::Mutex::new(intercepted),
    })
}
