//! Plan executor: staged blocks, checkpoint assertion with recovery,
//! container-event dispatch, pacing, dedup, and cancellation.

use crate::checkpoint::{EnsureOptions, HARD_STOPS};
use crate::container::matcher;
use crate::error::{Result, WebautoError};
use crate::ops;
use crate::persist::records::{self, LinkRecord};
use crate::persist::runstate;
use crate::persist::shard::fnv1a64;
use crate::session::{BrowserSession, CreateOptions};
use crate::state::AppState;
use crate::workflow::schema::{
    BlockAction, BlockSpec, ExecutionStatus, OnFailure, Pacing, Plan, Predicate, Trigger,
};
use crate::workflow::subscriptions::{ContainerState, Subscription, SubscriptionSet, TriggerEvent};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Grace given to an in-flight action once the plan is cancelled.
const CANCEL_GRACE_MS: u64 = 5_000;
/// Active-page observation cadence for container-event triggers.
const EVENT_POLL_INTERVAL_MS: u64 = 1_000;
/// Bounded dispatch queue; overflow is an error, not silent loss.
const DISPATCH_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOutcome {
    pub block_id: String,
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub output: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRun {
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub outcomes: Vec<BlockOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: u64,
    pub completed_at: u64,
}

/// Cancels the plan it was created with. Cancellation lands between
/// blocks, or aborts the running action after the grace window.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct PlanExecutor {
    state: Arc<AppState>,
    cancel: watch::Receiver<bool>,
    last_operation: Option<Instant>,
    last_navigation: Option<Instant>,
    /// Per-block dedup: last trigger signature that ran.
    event_dedup: HashMap<String, u64>,
}

impl PlanExecutor {
    pub fn new(state: Arc<AppState>) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                state,
                cancel: rx,
                last_operation: None,
                last_navigation: None,
                event_dedup: HashMap::new(),
            },
            CancelHandle { tx: Arc::new(tx) },
        )
    }

    /// Structural plan validation, before anything touches a browser.
    pub fn validate(plan: &Plan) -> Result<()> {
        let mut ids = HashSet::new();
        for block in &plan.blocks {
            if !ids.insert(block.id.as_str()) {
                return Err(WebautoError::Validation(format!(
                    "Duplicate block id: {}",
                    block.id
                )));
            }
        }
        for block in &plan.blocks {
            for dep in &block.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(WebautoError::Validation(format!(
                        "Block {} depends on unknown block {}",
                        block.id, dep
                    )));
                }
            }

            // A block may not assert and observe the same checkpoint in
            // one step; that is how block/checkpoint cycles form.
            if let (Some(checkpoint), Some(validation)) = (&block.checkpoint, &block.validation) {
                let observed = validation
                    .pre
                    .iter()
                    .chain(validation.post.iter())
                    .flat_map(|p| p.checkpoint_in.iter());
                for cp in observed {
                    if cp == &checkpoint.target_checkpoint {
                        return Err(WebautoError::Validation(format!(
                            "Block {} both asserts and observes checkpoint {}",
                            block.id, cp
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn execute(&mut self, plan: &Plan) -> PlanRun {
        let started_at = chrono::Utc::now().timestamp_millis() as u64;
        let mut run = PlanRun {
            plan_id: plan.id.clone(),
            status: ExecutionStatus::Running,
            outcomes: Vec::new(),
            error: None,
            started_at,
            completed_at: 0,
        };

        if let Err(e) = Self::validate(plan) {
            run.status = ExecutionStatus::Failed;
            run.error = Some(e.to_string());
            run.completed_at = chrono::Utc::now().timestamp_millis() as u64;
            return run;
        }

        self.state
            .broadcast("plan:started", json!({ "planId": plan.id }));

        let session = match self.obtain_session(plan).await {
            Ok(s) => s,
            Err(e) => {
                run.status = ExecutionStatus::Failed;
                run.error = Some(format!("{}: {}", e.code(), e));
                run.completed_at = chrono::Utc::now().timestamp_millis() as u64;
                return run;
            }
        };

        match self.run_startup_blocks(plan, &session, &mut run).await {
            Ok(completed) if run.status == ExecutionStatus::Running => {
                if let Err(e) = self
                    .run_event_blocks(plan, &session, &mut run, completed)
                    .await
                {
                    self.fail_run(&mut run, &e);
                }
            }
            Ok(_) => {}
            Err(e) => self.fail_run(&mut run, &e),
        }

        if run.status == ExecutionStatus::Running {
            let any_hard_failure = run.outcomes.iter().any(|o| {
                o.status == ExecutionStatus::Failed
                    && block_of(plan, &o.block_id)
                        .map(|b| b.on_failure != OnFailure::Continue)
                        .unwrap_or(false)
            });
            run.status = if *self.cancel.borrow() {
                ExecutionStatus::Cancelled
            } else if any_hard_failure {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            };
        }
        run.completed_at = chrono::Utc::now().timestamp_millis() as u64;

        if run.status == ExecutionStatus::Failed {
            self.write_debug_bundle(plan, &session, &run).await;
        }
        self.state.broadcast(
            "plan:completed",
            json!({ "planId": plan.id, "status": run.status }),
        );
        run
    }

    fn fail_run(&self, run: &mut PlanRun, e: &WebautoError) {
        run.status = ExecutionStatus::Failed;
        run.error = Some(format!("{}: {}", e.code(), e));
    }

    async fn obtain_session(&self, plan: &Plan) -> Result<Arc<BrowserSession>> {
        match self.state.session_manager.get(&plan.profile_id).await {
            Ok(session) => Ok(session),
            Err(WebautoError::SessionNotFound(_)) => {
                self.state
                    .session_manager
                    .create(&plan.profile_id, CreateOptions::default())
                    .await
            }
            Err(e) => Err(e),
        }
    }

    // ── Startup phase ──────────────────────────────────────────────

    /// Run the startup blocks in declaration order. Returns the ids of
    /// the blocks that succeeded, for dependency checks downstream.
    async fn run_startup_blocks(
        &mut self,
        plan: &Plan,
        session: &Arc<BrowserSession>,
        run: &mut PlanRun,
    ) -> Result<HashSet<String>> {
        let mut completed: HashSet<String> = HashSet::new();

        for block in plan.blocks.iter().filter(|b| b.trigger == Trigger::Startup) {
            if *self.cancel.borrow() {
                run.status = ExecutionStatus::Cancelled;
                return Ok(completed);
            }

            // A dependency that failed, was skipped, or has not run counts
            // as unmet.
            if let Some(unmet) = block
                .depends_on
                .iter()
                .find(|d| !completed.contains(d.as_str()))
            {
                let err = WebautoError::DependencyFailed {
                    block: block.id.clone(),
                    dependency: unmet.clone(),
                };
                run.outcomes.push(BlockOutcome {
                    block_id: block.id.clone(),
                    status: ExecutionStatus::Skipped,
                    attempts: 0,
                    duration_ms: 0,
                    error: Some(format!("{}: {}", err.code(), err)),
                    output: Value::Null,
                });
                continue;
            }

            let outcome = self.run_block(plan, block, session, None).await;
            let failed = outcome.status == ExecutionStatus::Failed;
            let cancelled = outcome.status == ExecutionStatus::Cancelled;
            let guard_stop = is_guard_outcome(&outcome);
            let stop_all = failed && block.on_failure == OnFailure::StopAll;
            if outcome.status == ExecutionStatus::Completed {
                completed.insert(block.id.clone());
            }
            run.outcomes.push(outcome);

            if guard_stop {
                // Guards stop the plan but leave the session for manual
                // intervention.
                run.status = ExecutionStatus::Failed;
                run.error = Some("guard checkpoint detected".to_string());
                return Ok(completed);
            }
            if stop_all {
                run.status = ExecutionStatus::Failed;
                run.error = Some(format!("Block {} failed", block.id));
                return Ok(completed);
            }
            if cancelled {
                run.status = ExecutionStatus::Cancelled;
                return Ok(completed);
            }
        }
        Ok(completed)
    }

    // ── Event phase ────────────────────────────────────────────────

    async fn run_event_blocks(
        &mut self,
        plan: &Plan,
        session: &Arc<BrowserSession>,
        run: &mut PlanRun,
        completed_startup: HashSet<String>,
    ) -> Result<()> {
        let mut subs = Vec::new();
        for block in &plan.blocks {
            if let Trigger::ContainerEvent {
                container,
                event,
                once_per_appear,
            } = &block.trigger
            {
                subs.push(Subscription::new(
                    block.id.clone(),
                    container.clone(),
                    *event,
                    block.pacing.event_cooldown_ms,
                    *once_per_appear,
                ));
            }
        }
        let mut set = SubscriptionSet::new(subs);
        if set.is_empty() {
            return Ok(());
        }

        let registry = self.state.registry();
        let topics = set.topics();
        let hard_topics: HashSet<String> = topics
            .iter()
            .filter(|t| {
                registry
                    .get(t)
                    .and_then(|d| d.checkpoint.as_deref())
                    .map(|cp| HARD_STOPS.contains(&cp))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let once_only = plan
            .blocks
            .iter()
            .filter_map(|b| match &b.trigger {
                Trigger::ContainerEvent {
                    once_per_appear: true,
                    ..
                } => Some(b.id.clone()),
                _ => None,
            })
            .collect::<HashSet<_>>();
        let event_block_ids: HashSet<String> = plan
            .blocks
            .iter()
            .filter(|b| matches!(b.trigger, Trigger::ContainerEvent { .. }))
            .map(|b| b.id.clone())
            .collect();
        let all_once = !once_only.is_empty() && once_only == event_block_ids;

        let mut queue: VecDeque<TriggerEvent> = VecDeque::new();
        let mut succeeded: HashSet<String> = HashSet::new();

        loop {
            if *self.cancel.borrow() {
                run.status = ExecutionStatus::Cancelled;
                return Ok(());
            }

            // Observe every topic on the active page.
            for topic in &topics {
                let observed = self.observe_topic(session, topic).await;
                let fired = set.observe(
                    topic,
                    observed,
                    Instant::now(),
                    hard_topics.contains(topic),
                );
                for event in fired {
                    if event.hard_stop {
                        queue.push_front(event);
                    } else {
                        queue.push_back(event);
                    }
                }
            }
            if queue.len() > DISPATCH_QUEUE_CAPACITY {
                return Err(WebautoError::SubscriptionOverflow(format!(
                    "{} pending triggers",
                    queue.len()
                )));
            }

            while let Some(event) = queue.pop_front() {
                if *self.cancel.borrow() {
                    run.status = ExecutionStatus::Cancelled;
                    return Ok(());
                }
                let Some(block) = block_of(plan, &event.block_id) else {
                    continue;
                };

                // Unmet dependencies park the trigger; the event may fire
                // again once the dependency lands.
                let deps_met = block.depends_on.iter().all(|d| {
                    completed_startup.contains(d.as_str()) || succeeded.contains(d.as_str())
                });
                if !deps_met {
                    tracing::debug!("Trigger for {} dropped: dependencies unmet", block.id);
                    continue;
                }

                // Dedup: the same event signature does not re-run a block.
                if self.event_dedup.get(&block.id) == Some(&event.signature) {
                    continue;
                }

                let outcome = self.run_block(plan, block, session, Some(&event)).await;
                let guard_stop = is_guard_outcome(&outcome);
                let stop_all = outcome.status == ExecutionStatus::Failed
                    && block.on_failure == OnFailure::StopAll;
                if outcome.status == ExecutionStatus::Completed {
                    self.event_dedup.insert(block.id.clone(), event.signature);
                    succeeded.insert(block.id.clone());
                }
                run.outcomes.push(outcome);

                if guard_stop {
                    run.status = ExecutionStatus::Failed;
                    run.error = Some("guard checkpoint detected".to_string());
                    return Ok(());
                }
                if stop_all {
                    run.status = ExecutionStatus::Failed;
                    run.error = Some(format!("Block {} failed", block.id));
                    return Ok(());
                }
            }

            // Once-per-appear plans finish when every event block has run.
            if all_once && succeeded == event_block_ids {
                return Ok(());
            }

            tokio::time::sleep(tokio::time::Duration::from_millis(EVENT_POLL_INTERVAL_MS)).await;
        }
    }

    async fn observe_topic(&self, session: &Arc<BrowserSession>, topic: &str) -> ContainerState {
        let registry = self.state.registry();
        let Some(def) = registry.get(topic) else {
            return ContainerState::default();
        };
        match matcher::match_in_scope(session, def, 3_000).await {
            Ok(results) => {
                let mut key = String::new();
                for r in &results {
                    key.push_str(&r.signature);
                    key.push(';');
                }
                ContainerState {
                    present: true,
                    count: results.len(),
                    signature: fnv1a64(key.as_bytes()),
                }
            }
            Err(_) => ContainerState::default(),
        }
    }

    // ── Block execution ────────────────────────────────────────────

    async fn run_block(
        &mut self,
        plan: &Plan,
        block: &BlockSpec,
        session: &Arc<BrowserSession>,
        trigger: Option<&TriggerEvent>,
    ) -> BlockOutcome {
        let started = Instant::now();
        self.state.broadcast(
            "block:started",
            json!({ "planId": plan.id, "blockId": block.id, "trigger": trigger.map(|t| t.container.clone()) }),
        );

        let max_attempts = block.retry + 1;
        let mut attempts = 0;
        let mut last_err: Option<WebautoError> = None;
        let mut output = Value::Null;
        let mut status = ExecutionStatus::Failed;

        while attempts < max_attempts {
            attempts += 1;
            let attempt = tokio::time::timeout(
                tokio::time::Duration::from_millis(block.timeout_ms),
                self.run_block_attempt(plan, block, session),
            )
            .await
            .unwrap_or(Err(WebautoError::ActionTimeout {
                action: format!("block:{}", block.id),
                timeout_ms: block.timeout_ms,
            }));

            match attempt {
                Ok(value) => {
                    output = value;
                    status = ExecutionStatus::Completed;
                    last_err = None;
                    break;
                }
                Err(e) if e.is_guard() => {
                    last_err = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "Block {} attempt {}/{} failed: {}",
                        block.id,
                        attempts,
                        max_attempts,
                        e
                    );
                    last_err = Some(e);
                }
            }

            if *self.cancel.borrow() {
                status = ExecutionStatus::Cancelled;
                break;
            }
        }

        let outcome = BlockOutcome {
            block_id: block.id.clone(),
            status,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
            error: last_err.map(|e| format!("{}: {}", e.code(), e)),
            output,
        };
        self.state.broadcast(
            "block:completed",
            json!({ "planId": plan.id, "blockId": block.id, "status": outcome.status }),
        );
        outcome
    }

    async fn run_block_attempt(
        &mut self,
        plan: &Plan,
        block: &BlockSpec,
        session: &Arc<BrowserSession>,
    ) -> Result<Value> {
        if let Some(validation) = &block.validation {
            if let Some(pre) = &validation.pre {
                if !self.check_predicate(session, pre).await? {
                    return Err(WebautoError::ValidationPreFailed(block.id.clone()));
                }
            }
        }

        if let Some(checkpoint) = &block.checkpoint {
            self.assert_checkpoint(block, checkpoint, session).await?;
        }

        let mut last_output = Value::Null;
        for action in &block.actions {
            if *self.cancel.borrow() {
                return Err(WebautoError::Validation("plan cancelled".to_string()));
            }
            self.pace(&block.pacing, matches!(action, BlockAction::Goto { .. }))
                .await;

            let action_fut = self.run_action(plan, session, action);
            tokio::pin!(action_fut);
            let mut cancel = self.cancel.clone();
            last_output = tokio::select! {
                result = &mut action_fut => result?,
                _ = async {
                    // Grace window after cancellation before the action is
                    // abandoned.
                    loop {
                        if *cancel.borrow() { break; }
                        if cancel.changed().await.is_err() { std::future::pending::<()>().await; }
                    }
                    tokio::time::sleep(tokio::time::Duration::from_millis(CANCEL_GRACE_MS)).await;
                } => {
                    return Err(WebautoError::Validation("plan cancelled".to_string()));
                }
            };
        }

        if let Some(validation) = &block.validation {
            if let Some(post) = &validation.post {
                if !self.check_predicate(session, post).await? {
                    return Err(WebautoError::ValidationPostFailed(block.id.clone()));
                }
            }
        }

        Ok(last_output)
    }

    async fn assert_checkpoint(
        &self,
        block: &BlockSpec,
        spec: &crate::workflow::schema::CheckpointSpec,
        session: &Arc<BrowserSession>,
    ) -> Result<()> {
        let detector = self.state.detector();
        let registry = self.state.registry();
        let opts = EnsureOptions {
            timeout_ms: spec.timeout_ms,
            allow_one_level_up: spec.allow_one_level_up_fallback,
        };

        let mut attempt = 0;
        loop {
            // Guards are terminal for plans, so the guarding variant is
            // used here rather than the raw ensure API.
            match detector
                .ensure_guarding(session, &registry, &spec.target_checkpoint, opts.clone())
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_guard() => return Err(e),
                Err(e) => {
                    if attempt >= spec.recovery.attempts {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::info!(
                        "Block {}: checkpoint {} not reached, recovery attempt {}/{}",
                        block.id,
                        spec.target_checkpoint,
                        attempt,
                        spec.recovery.attempts
                    );
                    for action in &spec.recovery.actions {
                        self.run_recovery_action(session, action).await?;
                    }
                }
            }
        }
    }

    async fn run_recovery_action(
        &self,
        session: &Arc<BrowserSession>,
        action: &crate::workflow::schema::RecoveryAction,
    ) -> Result<()> {
        use crate::workflow::schema::RecoveryAction;
        match action {
            RecoveryAction::PressKey { key } => session.press_key(key).await,
            RecoveryAction::ClickContainer { container } => {
                let registry = self.state.registry();
                ops::click(session, &registry, container, ops::ClickConfig::default())
                    .await
                    .map(|_| ())
            }
            RecoveryAction::Wait { ms } => {
                tokio::time::sleep(tokio::time::Duration::from_millis(*ms)).await;
                Ok(())
            }
        }
    }

    async fn check_predicate(
        &self,
        session: &Arc<BrowserSession>,
        predicate: &Predicate,
    ) -> Result<bool> {
        if predicate.is_empty() {
            return Ok(true);
        }

        if let Some(host) = &predicate.host_includes {
            let url = session.url().await?;
            let host_part = url
                .split("://")
                .nth(1)
                .unwrap_or(&url)
                .split('/')
                .next()
                .unwrap_or("");
            if !host_part.contains(host.as_str()) {
                return Ok(false);
            }
        }

        if !predicate.checkpoint_in.is_empty() {
            let detection = self
                .state
                .detector()
                .detect(session, &self.state.registry())
                .await?;
            if !predicate
                .checkpoint_in
                .iter()
                .any(|cp| cp == &detection.checkpoint)
            {
                return Ok(false);
            }
        }

        if let Some(check) = &predicate.container {
            let registry = self.state.registry();
            let count = match matcher::match_container(
                session,
                &registry,
                &check.selector,
                matcher::DEFAULT_MATCH_TIMEOUT_MS,
            )
            .await
            {
                Ok(results) => results.len(),
                Err(WebautoError::ContainerNoMatch(_)) => 0,
                Err(e) => return Err(e),
            };
            if check.must_exist && count == 0 {
                return Ok(false);
            }
            if count < check.min_count {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Minimum spacing between operations and between navigations, plus a
    /// deterministic jitter.
    async fn pace(&mut self, pacing: &Pacing, is_navigation: bool) {
        let now = Instant::now();
        let jitter = if pacing.jitter_ms > 0 {
            (chrono::Utc::now().timestamp_subsec_nanos() as u64) % pacing.jitter_ms
        } else {
            0
        };

        let mut wait_ms = 0u64;
        if let Some(last) = self.last_operation {
            let elapsed = now.duration_since(last).as_millis() as u64;
            let min = pacing.operation_min_interval_ms + jitter;
            if elapsed < min {
                wait_ms = wait_ms.max(min - elapsed);
            }
        }
        if is_navigation {
            if let Some(last) = self.last_navigation {
                let elapsed = now.duration_since(last).as_millis() as u64;
                if elapsed < pacing.navigation_min_interval_ms {
                    wait_ms = wait_ms.max(pacing.navigation_min_interval_ms - elapsed);
                }
            }
        }

        if wait_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(wait_ms)).await;
        }
        self.last_operation = Some(Instant::now());
        if is_navigation {
            self.last_navigation = Some(Instant::now());
        }
    }

    async fn run_action(
        &self,
        plan: &Plan,
        session: &Arc<BrowserSession>,
        action: &BlockAction,
    ) -> Result<Value> {
        let registry = self.state.registry();
        match action {
            BlockAction::Goto { url, timeout_ms } => {
                session.goto(url, *timeout_ms).await?;
                Ok(json!({ "url": url }))
            }
            BlockAction::EnsureCheckpoint {
                target,
                timeout_ms,
                allow_one_level_up_fallback,
            } => {
                let detection = self
                    .state
                    .detector()
                    .ensure_guarding(
                        session,
                        &registry,
                        target,
                        EnsureOptions {
                            timeout_ms: *timeout_ms,
                            allow_one_level_up: *allow_one_level_up_fallback,
                        },
                    )
                    .await?;
                Ok(serde_json::to_value(detection)?)
            }
            BlockAction::ContainerOp {
                container,
                operation,
                config,
            } => {
                use crate::container::schema::OperationId;
                let parse_cfg = |cfg: &Value| -> Value {
                    if cfg.is_null() {
                        json!({})
                    } else {
                        cfg.clone()
                    }
                };
                let cfg = parse_cfg(config);
                match operation {
                    OperationId::Click => {
                        let cfg: ops::ClickConfig = serde_json::from_value(cfg)?;
                        Ok(serde_json::to_value(
                            ops::click(session, &registry, container, cfg).await?,
                        )?)
                    }
                    OperationId::Scroll => {
                        let cfg: ops::ScrollConfig = serde_json::from_value(cfg)?;
                        Ok(serde_json::to_value(
                            ops::scroll(session, &registry, container, cfg).await?,
                        )?)
                    }
                    OperationId::Highlight => {
                        let cfg: ops::HighlightConfig = serde_json::from_value(cfg)?;
                        Ok(serde_json::to_value(
                            ops::highlight(session, &registry, container, cfg).await?,
                        )?)
                    }
                    OperationId::Extract => {
                        let cfg: ops::ExtractConfig = serde_json::from_value(cfg)?;
                        Ok(serde_json::to_value(
                            ops::extract(session, &registry, container, cfg).await?,
                        )?)
                    }
                    OperationId::Type => {
                        let cfg: ops::TypeConfig = serde_json::from_value(cfg)?;
                        ops::type_text(session, cfg).await?;
                        Ok(json!({ "ok": true }))
                    }
                }
            }
            BlockAction::PressKey { key } => {
                session.press_key(key).await?;
                Ok(json!({ "pressed": key }))
            }
            BlockAction::TypeText {
                text,
                delay_ms,
                submit,
            } => {
                ops::type_text(
                    session,
                    ops::TypeConfig {
                        text: text.clone(),
                        delay_ms: *delay_ms,
                        submit: *submit,
                    },
                )
                .await?;
                Ok(json!({ "typed": text.chars().count() }))
            }
            BlockAction::Sleep { ms } => {
                tokio::time::sleep(tokio::time::Duration::from_millis(*ms)).await;
                Ok(Value::Null)
            }
            BlockAction::CollectLinks {
                container,
                url_field,
                target_count,
            } => {
                self.collect_links(plan, session, &registry, container, url_field, *target_count)
                    .await
            }
            BlockAction::SaveCookies { force } => {
                let cookies = session.cookies().await?;
                if *force {
                    self.state
                        .cookie_store
                        .force_save(session.profile_id(), &cookies)
                        .await?;
                    Ok(json!({ "saved": true, "reason": "forced" }))
                } else {
                    let outcome = self
                        .state
                        .cookie_store
                        .save_if_stable(session.profile_id(), &cookies)
                        .await?;
                    Ok(json!({ "saved": outcome.saved, "reason": outcome.reason }))
                }
            }
        }
    }

    /// Extract links from a list container, shard-filter, dedup against
    /// the run state, and append link records. Idempotent across resumes.
    async fn collect_links(
        &self,
        plan: &Plan,
        session: &Arc<BrowserSession>,
        registry: &crate::container::ContainerRegistry,
        container: &str,
        url_field: &str,
        target_count: u64,
    ) -> Result<Value> {
        let dir = {
            let config = self.state.config.read();
            runstate::keyword_dir(&config.download_dir(), &plan.platform, &plan.env, &plan.keyword)
        };
        let mut state = runstate::load_state(&dir).await?;
        if target_count > 0 {
            state.list_collection.target_count = target_count;
        }

        let outcome = ops::extract(
            session,
            registry,
            container,
            ops::ExtractConfig {
                fields: None,
                max_items: None,
                visible_only: false,
            },
        )
        .await?;

        let search_url = session.url().await?;
        let now = chrono::Utc::now().timestamp_millis() as u64;
        let mut added = 0u64;

        for row in &outcome.rows {
            let Some(url) = row.get(url_field).and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(note_id) = records::note_id_from_url(url) else {
                continue;
            };
            if let Some(shard) = &plan.shard {
                if !shard.includes_note(&note_id) {
                    continue;
                }
            }
            if !state.record_note(&note_id) {
                continue;
            }

            let record = LinkRecord {
                note_id,
                url: url.to_string(),
                title: row
                    .get("title")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                search_url: search_url.clone(),
                keyword: plan.keyword.clone(),
                collected_at: now,
            };
            records::append_jsonl(&dir.join(records::LINKS_FILE), &record).await?;
            added += 1;

            if state.is_complete() {
                break;
            }
        }

        state.status = if state.is_complete() {
            runstate::RunStatus::Completed
        } else {
            runstate::RunStatus::Running
        };
        state.resume.last_step = Some("collect_links".to_string());
        runstate::save_state(&dir, &state).await?;

        Ok(json!({
            "added": added,
            "collected": state.list_collection.collected_note_ids.len(),
            "targetCount": state.list_collection.target_count,
        }))
    }

    async fn write_debug_bundle(&self, plan: &Plan, session: &Arc<BrowserSession>, run: &PlanRun) {
        let (artifacts, screenshots, dir) = {
            let config = self.state.config.read();
            (
                config.debug.artifacts,
                config.debug.screenshots,
                runstate::keyword_dir(
                    &config.download_dir(),
                    &plan.platform,
                    &plan.env,
                    &plan.keyword,
                )
                .join("plan-error")
                .join(&plan.id),
            )
        };
        if !artifacts {
            return;
        }
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!("Debug bundle dir failed: {}", e);
            return;
        }

        if let Ok(text) = serde_json::to_string_pretty(run) {
            let _ = tokio::fs::write(dir.join("run.json"), text).await;
        }
        let recent = self
            .state
            .action_log
            .get_filtered(Some(&plan.profile_id), 50);
        if let Ok(text) = serde_json::to_string_pretty(&recent) {
            let _ = tokio::fs::write(dir.join("actions.json"), text).await;
        }
        if screenshots {
            if let Ok(b64) = session.screenshot(false).await {
                use base64::Engine;
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(b64) {
                    let _ = tokio::fs::write(dir.join("page.png"), bytes).await;
                }
            }
        }
        tracing::info!("Debug bundle written to {:?}", dir);
    }
}

fn block_of<'a>(plan: &'a Plan, id: &str) -> Option<&'a BlockSpec> {
    plan.blocks.iter().find(|b| b.id == id)
}

fn is_guard_outcome(outcome: &BlockOutcome) -> bool {
    outcome
        .error
        .as_deref()
        .map(|e| e.contains("LOGIN_GUARD_DETECTED") || e.contains("RISK_CONTROL_DETECTED"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::{CheckpointSpec, Recovery, Validation};

    fn block(id: &str) -> BlockSpec {
        serde_json::from_value(json!({ "id": id, "actions": [] })).unwrap()
    }

    fn plan(blocks: Vec<BlockSpec>) -> Plan {
        Plan {
            id: "p".into(),
            profile_id: "xiaohongshu_fresh".into(),
            platform: "xiaohongshu".into(),
            env: "prod".into(),
            keyword: "tea".into(),
            shard: None,
            blocks,
        }
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let p = plan(vec![block("a"), block("a")]);
        assert!(PlanExecutor::validate(&p).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let mut b = block("a");
        b.depends_on = vec!["ghost".into()];
        let p = plan(vec![b]);
        let err = PlanExecutor::validate(&p).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_validate_rejects_assert_and_observe_cycle() {
        let mut b = block("a");
        b.checkpoint = Some(CheckpointSpec {
            container_id: None,
            target_checkpoint: "search_ready".into(),
            recovery: Recovery::default(),
            allow_one_level_up_fallback: false,
            timeout_ms: 1_000,
        });
        b.validation = Some(Validation {
            pre: Some(Predicate {
                host_includes: None,
                checkpoint_in: vec!["search_ready".into()],
                container: None,
            }),
            post: None,
        });
        let p = plan(vec![b]);
        let err = PlanExecutor::validate(&p).unwrap_err();
        assert!(err.to_string().contains("asserts and observes"));
    }

    #[test]
    fn test_validate_accepts_well_formed_plan() {
        let mut b2 = block("b");
        b2.depends_on = vec!["a".into()];
        let p = plan(vec![block("a"), b2]);
        PlanExecutor::validate(&p).unwrap();
    }
}
