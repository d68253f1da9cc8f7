//! Screen driver - walks the app's state machine one edge at a time

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{E2eError, E2eResult};
use crate::page::{PageHandle, WaitState};
use crate::screen::{self, Control, Field, ScreenId, Transition, TransitionKind, ACTIVE_SCREEN, APP_CONTAINER};
use crate::timing::Timings;

pub struct ScreenDriver {
    page: Arc<dyn PageHandle>,
    base_url: String,
    timings: Timings,
}

impl ScreenDriver {
    pub fn new(page: Arc<dyn PageHandle>, base_url: impl Into<String>, timings: Timings) -> Self {
        Self {
            page,
            base_url: base_url.into(),
            timings,
        }
    }

    pub fn page(&self) -> &Arc<dyn PageHandle> {
        &self.page
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Load the app and wait for its container. With `dismiss`, the
    /// disclaimer is accepted before returning.
    pub async fn open(&self, dismiss: bool) -> E2eResult<Option<ScreenId>> {
        info!("Opening {}", self.base_url);
        self.page.goto(&self.base_url, self.timings.navigation_timeout()).await?;
        self.after_load(dismiss).await
    }

    /// Full page reload. The app shows the disclaimer again on every load.
    pub async fn reload(&self, dismiss: bool) -> E2eResult<Option<ScreenId>> {
        info!("Reloading page");
        self.page.reload(self.timings.navigation_timeout()).await?;
        self.after_load(dismiss).await
    }

    async fn after_load(&self, dismiss: bool) -> E2eResult<Option<ScreenId>> {
        self.page
            .wait_for(APP_CONTAINER, WaitState::Attached, self.timings.navigation_timeout())
            .await
            .map_err(|e| self.not_found(e, APP_CONTAINER))?;
        if dismiss {
            self.dismiss_disclaimer().await?;
        }
        self.current_screen().await
    }

    pub async fn disclaimer_visible(&self) -> E2eResult<bool> {
        self.page.is_visible(&ScreenId::DisclaimerModal.root_selector()).await
    }

    /// Screen carrying the `active` class, ignoring the disclaimer overlay
    pub async fn active_screen(&self) -> E2eResult<Option<ScreenId>> {
        match self.page.element_id(ACTIVE_SCREEN).await? {
            Some(id) => Ok(Some(id.parse()?)),
            None => Ok(None),
        }
    }

    /// What the user sees: the disclaimer while it is up, otherwise the active screen
    pub async fn current_screen(&self) -> E2eResult<Option<ScreenId>> {
        if self.disclaimer_visible().await? {
            return Ok(Some(ScreenId::DisclaimerModal));
        }
        self.active_screen().await
    }

    /// Accept the disclaimer if it is showing. The app re-shows it after every
    /// load regardless of earlier acceptance, so this is an expected branch.
    pub async fn dismiss_disclaimer(&self) -> E2eResult<bool> {
        if !self.disclaimer_visible().await? {
            return Ok(false);
        }

        debug!("Disclaimer is up; accepting it");
        let accept = screen::transition(ScreenId::DisclaimerModal, ScreenId::Welcome)
            .and_then(|t| t.trigger)
            .unwrap_or(Control::AcceptDisclaimer);
        self.click(accept).await?;

        sleep(self.timings.disclaimer_fade()).await;
        self.wait_state(
            &ScreenId::DisclaimerModal.root_selector(),
            WaitState::Hidden,
            self.timings.direct_timeout(),
        )
        .await?;
        Ok(true)
    }

    /// Fill named fields; selects take their option by value.
    pub async fn fill(&self, values: &[(Field, String)]) -> E2eResult<()> {
        for (field, value) in values {
            debug!("Filling {} = {:?}", field, value);
            let result = if field.is_select() {
                self.page.select_option(field.selector(), value).await
            } else {
                self.page.fill(field.selector(), value).await
            };
            result.map_err(|e| self.not_found(e, field.selector()))?;
        }
        Ok(())
    }

    pub async fn input_value(&self, field: Field) -> E2eResult<String> {
        self.page.input_value(field.selector()).await
    }

    /// Take exactly one edge of the transition table towards `target`.
    ///
    /// On success the target's root is visible and the screen it replaced is not.
    pub async fn goto(&self, target: ScreenId, fields: &[(Field, String)]) -> E2eResult<ScreenId> {
        if target == ScreenId::DisclaimerModal {
            return if self.disclaimer_visible().await? {
                Ok(target)
            } else {
                Err(E2eError::InvalidTransition {
                    from: self.active_screen().await?.unwrap_or(ScreenId::Welcome),
                    to: target,
                })
            };
        }

        self.dismiss_disclaimer().await?;

        let current = self
            .active_screen()
            .await?
            .ok_or_else(|| E2eError::ElementNotFound(ACTIVE_SCREEN.to_string()))?;

        if current == target {
            self.fill(fields).await?;
            return Ok(target);
        }

        let edge = screen::transition(current, target).ok_or(E2eError::InvalidTransition {
            from: current,
            to: target,
        })?;

        self.take(edge, fields).await
    }

    /// Follow the transition table until `target` is reached. Each field is
    /// filled on the screen that owns it.
    pub async fn walk_to(&self, target: ScreenId, fields: &[(Field, String)]) -> E2eResult<Vec<ScreenId>> {
        self.dismiss_disclaimer().await?;

        let start = self
            .active_screen()
            .await?
            .ok_or_else(|| E2eError::ElementNotFound(ACTIVE_SCREEN.to_string()))?;
        let edges = screen::path(start, target).ok_or(E2eError::InvalidTransition {
            from: start,
            to: target,
        })?;

        info!("Walking {} -> {} ({} steps)", start, target, edges.len());

        let mut visited = Vec::with_capacity(edges.len());
        for edge in edges {
            let here: Vec<(Field, String)> = fields
                .iter()
                .filter(|(f, _)| f.screen() == edge.from)
                .cloned()
                .collect();
            self.dismiss_disclaimer().await?;
            visited.push(self.take(edge, &here).await?);
        }

        // Fields owned by the destination itself are filled on arrival.
        let arrival: Vec<(Field, String)> = fields
            .iter()
            .filter(|(f, _)| f.screen() == target)
            .cloned()
            .collect();
        self.fill(&arrival).await?;

        Ok(visited)
    }

    async fn take(&self, edge: &Transition, fields: &[(Field, String)]) -> E2eResult<ScreenId> {
        debug!("Transition {} -> {} ({:?})", edge.from, edge.to, edge.kind);

        self.fill(fields).await?;

        if let Some(control) = edge.trigger {
            self.click(control).await?;
        }

        match edge.kind {
            TransitionKind::Direct | TransitionKind::Async => {
                sleep(edge.settle.duration(&self.timings)).await;
                self.wait_visible(edge.to, edge.timeout(&self.timings)).await?;
            }
            TransitionKind::Reset => {
                // The reloaded document greets with the disclaimer again.
                self.wait_state(
                    &ScreenId::DisclaimerModal.root_selector(),
                    WaitState::Visible,
                    self.timings.navigation_timeout(),
                )
                .await?;
                self.dismiss_disclaimer().await?;
                self.wait_visible(edge.to, self.timings.direct_timeout()).await?;
            }
        }

        if !edge.from.is_overlay() && edge.from != edge.to {
            self.wait_state(&edge.from.root_selector(), WaitState::Hidden, self.timings.direct_timeout())
                .await?;
        }

        info!("Reached {}", edge.to);
        Ok(edge.to)
    }

    async fn click(&self, control: Control) -> E2eResult<()> {
        let selector = control.selector();
        self.page
            .click(&selector, self.timings.action_timeout())
            .await
            .map_err(|e| self.not_found(e, &selector))
    }

    async fn wait_visible(&self, screen: ScreenId, timeout: Duration) -> E2eResult<()> {
        self.wait_state(&screen.root_selector(), WaitState::Visible, timeout).await
    }

    /// Explicit wait; a timeout is reported with the last screen the user could see.
    async fn wait_state(&self, selector: &str, state: WaitState, timeout: Duration) -> E2eResult<()> {
        match self.page.wait_for(selector, state, timeout).await {
            Err(E2eError::Timeout { .. }) => {
                let last_screen = self.current_screen().await.ok().flatten();
                Err(E2eError::Timeout {
                    what: format!("{} to be {}", selector, state.as_str()),
                    last_screen,
                })
            }
            other => other,
        }
    }

    /// A control that never became actionable is reported as missing.
    fn not_found(&self, err: E2eError, selector: &str) -> E2eError {
        match err {
            E2eError::Timeout { .. } => E2eError::ElementNotFound(selector.to_string()),
            other => other,
        }
    }
}
