//! ConcurrentTaskRunner - 同じ形のリモート呼び出しを N 個、並行数 K で実行
//!
//! # 流れ
//! 1. task id `1..=N` ごとに factory で RequestDescriptor を作る
//! 2. 各 task を spawn し、admission gate（Semaphore）の permit を待つ
//! 3. permit を持っている間だけ executor を呼ぶ（Running）
//! 4. 完了したものから回収し、最後に task id 順に並べて返す
//!
//! # 失敗時
//! - FailFast（既定）: 最初の失敗で新規 admission を止め、実行中の task は
//!   最後まで待ってから、分類済みの最初の失敗を返す（部分結果は返さない）
//! - Collect: 失敗も TaskResult（error 付き）として返す
//! - cancellation はどちらの policy でも呼び出し側に伝播する

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{StreamExt, stream::FuturesUnordered};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::classify::{EnrichedError, ErrorClassifier, ErrorContext};
use crate::config::RunnerConfig;
use crate::domain::{CorrelationId, ErrorKind, RequestDescriptor, TaskId, TaskResult, TaskState};
use crate::error::CourierError;
use crate::ports::{CorrelationIdGenerator, RemoteError, RemoteExecutor, SystemClock, UlidGenerator};

const INVOKE_OPERATION: &str = "runner.invoke";

/// What a run does when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop admitting tasks and fail the whole run with the first failure.
    #[default]
    FailFast,

    /// Keep going; failures become `TaskResult`s with `error` set.
    Collect,
}

pub struct ConcurrentTaskRunner<X, F> {
    executor: Arc<X>,
    factory: F,
    config: RunnerConfig,
    classifier: Arc<ErrorClassifier>,
    ids: Arc<dyn CorrelationIdGenerator>,
}

impl<X, F> ConcurrentTaskRunner<X, F>
where
    X: RemoteExecutor + 'static,
    F: Fn(TaskId) -> RequestDescriptor + Send + Sync,
{
    pub fn new(executor: X, factory: F) -> Self {
        Self::from_shared(Arc::new(executor), factory)
    }

    /// Use an executor that is also held elsewhere.
    pub fn from_shared(executor: Arc<X>, factory: F) -> Self {
        Self {
            executor,
            factory,
            config: RunnerConfig::default(),
            classifier: Arc::new(ErrorClassifier::default()),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn CorrelationIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// [`Self::run`] with `RunnerConfig::default_max_concurrency`.
    pub async fn run_default(
        &self,
        task_count: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult>, CourierError> {
        self.run(task_count, self.config.default_max_concurrency, cancel)
            .await
    }

    /// Run `task_count` tasks with at most `max_concurrency` executor calls
    /// in flight, under a freshly generated correlation id.
    pub async fn run(
        &self,
        task_count: u32,
        max_concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult>, CourierError> {
        let correlation_id = self.ids.generate_correlation_id();
        self.run_with_correlation(task_count, max_concurrency, correlation_id, cancel)
            .await
    }

    /// Run under the caller's correlation id. Every executor call and every
    /// ErrorRecord of the run carries it.
    ///
    /// Returns exactly `task_count` results ordered by task id, or the first
    /// failure (see [`FailurePolicy`]).
    pub async fn run_with_correlation(
        &self,
        task_count: u32,
        max_concurrency: usize,
        correlation_id: CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult>, CourierError> {
        if max_concurrency == 0 {
            return Err(CourierError::InvalidArgument(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if task_count == 0 {
            return Ok(Vec::new());
        }

        let policy = self.config.failure_policy;
        info!(
            %correlation_id,
            task_count,
            max_concurrency,
            ?policy,
            "starting run"
        );

        let gate = Arc::new(Semaphore::new(max_concurrency));
        // Stops admission. Fires on caller cancellation, on the first failure,
        // or when this future is dropped; calls already in flight run to completion.
        let admission = cancel.child_token();
        let _stop_admission = admission.clone().drop_guard();

        let mut in_flight = FuturesUnordered::new();
        for n in 1..=task_count {
            let task_id = TaskId::new(n);
            let task = TaskRun {
                task_id,
                request: (self.factory)(task_id),
                correlation_id,
                executor: Arc::clone(&self.executor),
                classifier: Arc::clone(&self.classifier),
                gate: Arc::clone(&gate),
                admission: admission.clone(),
                cancel: cancel.clone(),
                timeout: self.config.task_timeout(),
                policy,
            };
            in_flight.push(tokio::spawn(task.execute()));
        }

        let mut results = Vec::with_capacity(task_count as usize);
        let mut first_failure: Option<CourierError> = None;
        let mut skipped = 0usize;

        while let Some(joined) = in_flight.next().await {
            match joined {
                Ok(Completion::Finished(result)) => results.push(result),
                Ok(Completion::Failed(result, failure)) => {
                    let stops_run = policy == FailurePolicy::FailFast
                        || failure.record().kind == ErrorKind::Canceled;
                    if !stops_run {
                        results.push(*result);
                    } else if first_failure.is_none() {
                        admission.cancel();
                        first_failure = Some(CourierError::Operation(failure));
                    }
                }
                Ok(Completion::Skipped) => skipped += 1,
                Err(join_error) => {
                    admission.cancel();
                    if first_failure.is_none() {
                        first_failure = Some(CourierError::Join(join_error.to_string()));
                    }
                }
            }
        }

        if let Some(failure) = first_failure {
            info!(%correlation_id, skipped, "run failed");
            return Err(failure);
        }

        results.sort_by_key(|result| result.task_id);
        info!(%correlation_id, completed = results.len(), "run finished");
        Ok(results)
    }
}

enum Completion {
    Finished(TaskResult),
    Failed(Box<TaskResult>, EnrichedError),
    /// Never admitted because the run was already failing.
    Skipped,
}

/// Everything one spawned task owns.
struct TaskRun<X> {
    task_id: TaskId,
    request: RequestDescriptor,
    correlation_id: CorrelationId,
    executor: Arc<X>,
    classifier: Arc<ErrorClassifier>,
    gate: Arc<Semaphore>,
    admission: CancellationToken,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    policy: FailurePolicy,
}

impl<X: RemoteExecutor> TaskRun<X> {
    async fn execute(self) -> Completion {
        let permit = tokio::select! {
            biased;
            _ = self.admission.cancelled() => None,
            permit = Arc::clone(&self.gate).acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            if self.cancel.is_cancelled() {
                // Canceled while waiting: reported like an executor cancellation.
                return self.fail(RemoteError::Canceled, 0, TaskState::Pending);
            }
            self.transition(TaskState::Pending, TaskState::Skipped);
            return Completion::Skipped;
        };

        self.transition(TaskState::Pending, TaskState::Running);
        let started = Instant::now();
        let result = self.invoke().await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // The permit outlives fail(), so a failing run closes admission
        // before a waiting task can take the slot.
        let completion = match result {
            Ok(response) => {
                self.transition(TaskState::Running, TaskState::Succeeded);
                Completion::Finished(TaskResult::succeeded(
                    self.task_id,
                    self.request,
                    response.status,
                    duration_ms,
                ))
            }
            Err(failure) => self.fail(failure, duration_ms, TaskState::Running),
        };
        drop(permit);
        completion
    }

    async fn invoke(&self) -> Result<crate::domain::RemoteResponse, RemoteError> {
        let call = self
            .executor
            .invoke(&self.request, self.correlation_id, &self.cancel);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(RemoteError::Timeout(limit))),
            None => call.await,
        }
    }

    fn fail(self, failure: RemoteError, duration_ms: u64, from: TaskState) -> Completion {
        let mut context = ErrorContext::new();
        context.insert("task_id".to_string(), self.task_id.to_string());
        context.insert("target".to_string(), self.request.target.clone());

        let enriched = self
            .classifier
            .enrich(failure, INVOKE_OPERATION, self.correlation_id, context);
        let record = enriched.record().clone();

        let canceled = record.kind == ErrorKind::Canceled;
        if canceled || self.policy == FailurePolicy::FailFast {
            self.admission.cancel();
        }
        let state = if canceled {
            TaskState::Canceled
        } else {
            TaskState::Failed
        };
        self.transition(from, state);

        Completion::Failed(
            Box::new(TaskResult::failed(self.task_id, self.request, record, duration_ms)),
            enriched,
        )
    }

    fn transition(&self, from: TaskState, to: TaskState) {
        debug_assert!(from.can_transition_to(to), "{from:?} -> {to:?}");
        debug!(
            task_id = %self.task_id,
            correlation_id = %self.correlation_id,
            ?from,
            ?to,
            "task state changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RemoteResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    /// Counts calls and tracks the in-flight peak.
    #[derive(Default)]
    struct Probe {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        correlation_ids: Mutex<Vec<CorrelationId>>,
    }

    struct ScriptedExecutor {
        probe: Arc<Probe>,
        delay: Duration,
        /// Tasks whose id is a multiple of this fail with a 503.
        fail_every: Option<u32>,
        wait_for_cancel: bool,
    }

    impl ScriptedExecutor {
        fn new(probe: Arc<Probe>) -> Self {
            Self {
                probe,
                delay: Duration::from_millis(2),
                fail_every: None,
                wait_for_cancel: false,
            }
        }
    }

    fn task_number(request: &RequestDescriptor) -> u32 {
        request
            .target
            .rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap()
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn invoke(
            &self,
            request: &RequestDescriptor,
            correlation_id: CorrelationId,
            cancel: &CancellationToken,
        ) -> Result<RemoteResponse, RemoteError> {
            self.probe.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.peak.fetch_max(now, Ordering::SeqCst);
            self.probe.correlation_ids.lock().unwrap().push(correlation_id);

            let n = task_number(request);
            let outcome = if self.wait_for_cancel {
                cancel.cancelled().await;
                Err(RemoteError::Canceled)
            } else {
                // later tasks finish first
                tokio::time::sleep(self.delay * (20 - n.min(20))).await;
                match self.fail_every {
                    Some(m) if n % m == 0 => Err(RemoteError::status(503, "unavailable")),
                    _ => Ok(RemoteResponse::ok()),
                }
            };

            self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn request_for(id: TaskId) -> RequestDescriptor {
        RequestDescriptor::get(format!("/items/{}", id.get()))
    }

    fn runner(executor: ScriptedExecutor) -> ConcurrentTaskRunner<ScriptedExecutor, fn(TaskId) -> RequestDescriptor> {
        ConcurrentTaskRunner::new(executor, request_for as fn(TaskId) -> RequestDescriptor)
    }

    fn collect() -> RunnerConfig {
        RunnerConfig {
            failure_policy: FailurePolicy::Collect,
            ..RunnerConfig::default()
        }
    }

    #[tokio::test]
    async fn zero_tasks_make_no_calls() {
        let probe = Arc::new(Probe::default());
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&factory_calls);
        let runner = ConcurrentTaskRunner::new(ScriptedExecutor::new(probe.clone()), move |id| {
            counted.fetch_add(1, Ordering::SeqCst);
            request_for(id)
        });

        let results = runner.run(0, 3, &CancellationToken::new()).await.unwrap();

        assert!(results.is_empty());
        assert_eq!(factory_calls.load(Ordering::SeqCst), 0);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let runner = runner(ScriptedExecutor::new(Arc::default()));
        let err = runner.run(3, 0, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CourierError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn results_are_dense_and_ordered_by_task_id() {
        let probe = Arc::new(Probe::default());
        let runner = runner(ScriptedExecutor::new(probe.clone()));

        let results = runner.run(10, 4, &CancellationToken::new()).await.unwrap();

        let ids: Vec<u32> = results.iter().map(|r| r.task_id.get()).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
        for result in &results {
            assert_eq!(task_number(&result.request), result.task_id.get());
            assert!(result.outcome.success);
            assert!(result.error.is_none());
            assert_eq!(result.state(), TaskState::Succeeded);
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_calls_never_exceed_the_limit() {
        for limit in [1usize, 2, 3] {
            let probe = Arc::new(Probe::default());
            let runner = runner(ScriptedExecutor::new(probe.clone()));

            let results = runner.run(12, limit, &CancellationToken::new()).await.unwrap();

            assert_eq!(results.len(), 12);
            let peak = probe.peak.load(Ordering::SeqCst);
            assert!(peak >= 1 && peak <= limit, "peak {peak} with limit {limit}");
        }
    }

    #[tokio::test]
    async fn always_failing_executor_fails_the_run() {
        let probe = Arc::new(Probe::default());
        let executor = ScriptedExecutor {
            fail_every: Some(1),
            ..ScriptedExecutor::new(probe.clone())
        };
        let correlation_id = CorrelationId::from_ulid(Ulid::new());

        let err = runner(executor)
            .run_with_correlation(5, 2, correlation_id, &CancellationToken::new())
            .await
            .unwrap_err();

        let record = err.record().unwrap();
        assert_eq!(record.kind, ErrorKind::RemoteServerError);
        assert_eq!(record.correlation_id, correlation_id);
        assert_eq!(record.operation, INVOKE_OPERATION);
        assert_eq!(record.status_code(), 503);
        assert!(record.attributes.contains_key("task_id"));
    }

    #[tokio::test]
    async fn fail_fast_stops_admitting_new_tasks() {
        let probe = Arc::new(Probe::default());
        let executor = ScriptedExecutor {
            fail_every: Some(1),
            ..ScriptedExecutor::new(probe.clone())
        };

        let result = runner(executor).run(10, 1, &CancellationToken::new()).await;

        assert!(result.is_err());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn collect_policy_returns_failures_as_results() {
        let executor = ScriptedExecutor {
            fail_every: Some(2),
            ..ScriptedExecutor::new(Arc::default())
        };

        let results = runner(executor)
            .with_config(collect())
            .run(4, 2, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        for result in &results {
            if result.task_id.get() % 2 == 0 {
                let record = result.error.as_ref().unwrap();
                assert_eq!(record.kind, ErrorKind::RemoteServerError);
                assert_eq!(result.outcome.status, 503);
                assert!(!result.outcome.success);
                assert_eq!(result.state(), TaskState::Failed);
            } else {
                assert!(result.error.is_none());
            }
        }
    }

    #[tokio::test]
    async fn task_timeout_is_reported_as_timeout() {
        let executor = ScriptedExecutor {
            delay: Duration::from_millis(50),
            ..ScriptedExecutor::new(Arc::default())
        };
        let config = RunnerConfig {
            task_timeout_ms: Some(5),
            ..collect()
        };

        let results = runner(executor)
            .with_config(config)
            .run(2, 2, &CancellationToken::new())
            .await
            .unwrap();

        for result in results {
            assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
            assert_eq!(result.outcome.status, 504);
        }
    }

    #[tokio::test]
    async fn executor_cancellation_propagates() {
        let probe = Arc::new(Probe::default());
        let executor = ScriptedExecutor {
            wait_for_cancel: true,
            ..ScriptedExecutor::new(probe.clone())
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = runner(executor)
            .with_config(collect())
            .run(3, 3, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.record().unwrap().kind, ErrorKind::Canceled);
        assert_eq!(probe.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn canceled_before_start_never_calls_the_executor() {
        let probe = Arc::new(Probe::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner(ScriptedExecutor::new(probe.clone()))
            .run(3, 1, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.record().unwrap().kind, ErrorKind::Canceled);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_correlation_id_per_run() {
        let probe = Arc::new(Probe::default());
        let runner = runner(ScriptedExecutor::new(probe.clone()));
        let correlation_id = CorrelationId::from_ulid(Ulid::new());

        runner
            .run_with_correlation(6, 3, correlation_id, &CancellationToken::new())
            .await
            .unwrap();

        let seen = probe.correlation_ids.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|id| *id == correlation_id));
    }

    #[tokio::test]
    async fn run_default_uses_configured_concurrency() {
        let probe = Arc::new(Probe::default());
        let config = RunnerConfig {
            default_max_concurrency: 1,
            ..RunnerConfig::default()
        };

        let results = runner(ScriptedExecutor::new(probe.clone()))
            .with_config(config)
            .run_default(4, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_run_stops_admission() {
        let probe = Arc::new(Probe::default());
        let executor = ScriptedExecutor {
            delay: Duration::from_millis(1),
            ..ScriptedExecutor::new(probe.clone())
        };
        let runner = runner(executor);
        let cancel = CancellationToken::new();

        let outcome =
            tokio::time::timeout(Duration::from_millis(30), runner.run(10, 1, &cancel)).await;
        assert!(outcome.is_err());
        let calls_at_drop = probe.calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(300)).await;

        let calls_after = probe.calls.load(Ordering::SeqCst);
        assert!(calls_after <= calls_at_drop + 1, "{calls_at_drop} -> {calls_after}");
        assert!(calls_after < 10);
        assert_eq!(probe.in_flight.load(Ordering::SeqCst), 0);
    }

    struct PanickingExecutor;

    #[async_trait]
    impl RemoteExecutor for PanickingExecutor {
        async fn invoke(
            &self,
            _request: &RequestDescriptor,
            _correlation_id: CorrelationId,
            _cancel: &CancellationToken,
        ) -> Result<RemoteResponse, RemoteError> {
            panic!("executor bug")
        }
    }

    #[tokio::test]
    async fn panicking_executor_is_a_join_error() {
        let runner = ConcurrentTaskRunner::new(PanickingExecutor, request_for);
        let err = runner.run(2, 2, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CourierError::Join(_)));
    }
}
