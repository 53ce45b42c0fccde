//! Resumable page automation.
//!
//! Progress is persisted per tab around every page step: the step's own index
//! before it runs, the next index once it succeeded. A host torn down by a
//! navigation the step triggered therefore resumes at the following step,
//! while a crash in the middle of a step replays only that step.

use async_trait::async_trait;
use std::sync::Arc;
use tabpilot_core::config::FlowConfig;
use tabpilot_core::{
    Error, Flow, FlowAction, FlowState, FlowStep, FlowStepError, FlowStepErrorKind, Result, TabId,
};
use tabpilot_storage::FlowStateRepository;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const XPATH_PREFIX: &str = "xpath:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Css(String),
    XPath(String),
}

impl Selector {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(XPATH_PREFIX) {
            Some(expr) => Selector::XPath(expr.to_string()),
            None => Selector::Css(raw.to_string()),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Css(s) => f.write_str(s),
            Selector::XPath(s) => write!(f, "{}{}", XPATH_PREFIX, s),
        }
    }
}

/// DOM access inside a tab, provided by the automation host.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Whether the selector currently resolves to an element.
    async fn exists(&self, tab_id: TabId, selector: &Selector) -> Result<bool>;
    async fn click(&self, tab_id: TabId, selector: &Selector) -> Result<()>;
    /// Set the value and dispatch `input` and `change` so page listeners react.
    async fn fill(&self, tab_id: TabId, selector: &Selector, value: &str) -> Result<()>;
    async fn scroll_into_view(&self, tab_id: TabId, selector: &Selector) -> Result<()>;
    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<()>;
}

/// Receives the text of `message` steps as they are reached.
#[async_trait]
pub trait FlowReporter: Send + Sync {
    async fn report(&self, tab_id: TabId, text: &str) -> Result<()>;
}

pub struct FlowExecutor {
    tab_id: TabId,
    driver: Arc<dyn PageDriver>,
    states: FlowStateRepository,
    reporter: Arc<dyn FlowReporter>,
    config: FlowConfig,
}

impl FlowExecutor {
    pub fn new(
        tab_id: TabId,
        driver: Arc<dyn PageDriver>,
        states: FlowStateRepository,
        reporter: Arc<dyn FlowReporter>,
        config: FlowConfig,
    ) -> Self {
        Self {
            tab_id,
            driver,
            states,
            reporter,
            config,
        }
    }

    /// Persisted progress, if a flow was interrupted on this tab.
    pub async fn pending(&self) -> Result<Option<FlowState>> {
        self.states.load(self.tab_id).await
    }

    /// Run `flow`, unless progress is persisted for the tab, in which case the
    /// persisted steps continue instead.
    pub async fn execute(&self, flow: &Flow) -> Result<()> {
        match self.pending().await? {
            Some(state) => {
                info!(tab_id = self.tab_id, step = state.current_step_index, "Continuing persisted flow");
                self.run(&state.steps, state.current_step_index).await
            }
            None => self.run(&flow.steps, 0).await,
        }
    }

    /// Continue a persisted flow. Returns false when there was nothing to resume.
    pub async fn resume(&self) -> Result<bool> {
        let Some(state) = self.pending().await? else {
            return Ok(false);
        };
        info!(tab_id = self.tab_id, step = state.current_step_index, "Resuming flow");
        self.run(&state.steps, state.current_step_index).await?;
        Ok(true)
    }

    async fn run(&self, steps: &[FlowStep], start: usize) -> Result<()> {
        let result = self.run_steps(steps, start).await;
        if let Err(e) = self.states.clear(self.tab_id).await {
            warn!(tab_id = self.tab_id, error = %e, "Failed to clear flow state");
        }
        result
    }

    async fn run_steps(&self, steps: &[FlowStep], start: usize) -> Result<()> {
        for (index, step) in steps.iter().enumerate().skip(start) {
            if step.action == FlowAction::Message {
                self.reporter
                    .report(self.tab_id, step.value.as_deref().unwrap_or_default())
                    .await?;
                continue;
            }

            self.save(steps, index).await?;
            debug!(tab_id = self.tab_id, index, action = %step.action, "Running flow step");
            self.run_step(step).await?;
            self.save(steps, index + 1).await?;
            tokio::time::sleep(self.config.settle_delay()).await;
        }
        Ok(())
    }

    async fn save(&self, steps: &[FlowStep], index: usize) -> Result<()> {
        let state = FlowState {
            steps: steps.to_vec(),
            current_step_index: index,
        };
        self.states.save(self.tab_id, &state).await
    }

    async fn run_step(&self, step: &FlowStep) -> std::result::Result<(), FlowStepError> {
        let fail = |kind| FlowStepError::new(step.clone(), kind);

        if step.action == FlowAction::Goto {
            if let Some(url) = step.value.as_deref() {
                self.driver
                    .navigate(self.tab_id, url)
                    .await
                    .map_err(|e| self.unexpected(step, e))?;
            }
            return Ok(());
        }
        if !matches!(step.action, FlowAction::Click | FlowAction::Fill | FlowAction::Scroll) {
            return Err(fail(FlowStepErrorKind::UnexpectedAction));
        }

        let raw = step
            .selector
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| fail(FlowStepErrorKind::MissingSelector))?;
        let selector = Selector::parse(raw);
        self.wait_for_element(step, &selector).await?;

        let outcome = match step.action {
            FlowAction::Click => self.driver.click(self.tab_id, &selector).await,
            FlowAction::Fill => {
                let value = step.value.as_deref().unwrap_or_default();
                self.driver.fill(self.tab_id, &selector, value).await
            }
            _ => self.driver.scroll_into_view(self.tab_id, &selector).await,
        };
        outcome.map_err(|e| self.unexpected(step, e))
    }

    async fn wait_for_element(&self, step: &FlowStep, selector: &Selector) -> std::result::Result<(), FlowStepError> {
        let deadline = Instant::now() + self.config.element_timeout();
        loop {
            match self.driver.exists(self.tab_id, selector).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => return Err(self.unexpected(step, e)),
            }
            if Instant::now() >= deadline {
                return Err(FlowStepError::new(step.clone(), FlowStepErrorKind::MissingElement));
            }
            tokio::time::sleep(self.config.element_poll()).await;
        }
    }

    fn unexpected(&self, step: &FlowStep, e: Error) -> FlowStepError {
        error!(
            tab_id = self.tab_id,
            action = %step.action,
            selector = step.selector.as_deref().unwrap_or_default(),
            error = %e,
            "Error while running flow step"
        );
        FlowStepError::new(step.clone(), FlowStepErrorKind::UnexpectedError)
    }
}
