use slimforge_runtime::{
    AnyCancel, Backoff, CancelFlag, CancellationToken, KeystrokeCancel, NeverCancel,
    ProcessSupervisor, RetryPolicy, SupervisorPolicy, SystemBackend,
};
use slimforge_schema::NormalizedProfile;
use std::sync::Arc;
use std::time::Duration;

const CLEAR_PAUSE: Duration = Duration::from_millis(500);

/// Everything a run needs, passed explicitly instead of living in globals.
///
/// `skip` is the per-step "skip this" token (keystroke and/or programmatic);
/// it is re-armed before every supervised step. `shutdown` is the run-wide
/// interrupt set by the ctrl-c handler and is never reset.
#[derive(Clone)]
pub struct RunContext {
    pub backend: Arc<dyn SystemBackend>,
    pub supervisor: ProcessSupervisor,
    pub skip: Arc<dyn CancellationToken>,
    pub shutdown: CancelFlag,
    pub settle: Duration,
    pub sentinel: String,
    pub clear_retry: RetryPolicy,
    pub load_retry: RetryPolicy,
    pub unload_retry: RetryPolicy,
    pub setting_retry: RetryPolicy,
}

impl RunContext {
    /// Defaults with no delays, for tests and tooling.
    pub fn new(backend: Arc<dyn SystemBackend>) -> Self {
        Self {
            backend,
            supervisor: ProcessSupervisor::default(),
            skip: Arc::new(NeverCancel),
            shutdown: CancelFlag::new(),
            settle: Duration::ZERO,
            sentinel: "Windows".to_owned(),
            clear_retry: RetryPolicy::new(5, Backoff::None).retry_if(|_| true),
            load_retry: RetryPolicy::new(3, Backoff::None),
            unload_retry: RetryPolicy::new(2, Backoff::None),
            setting_retry: RetryPolicy::new(5, Backoff::None),
        }
    }

    /// Build the context a profile asks for.
    ///
    /// A configured cancel key and the programmatic `skip` flag both count
    /// as "skip this step".
    pub fn from_profile(
        backend: Arc<dyn SystemBackend>,
        profile: &NormalizedProfile,
        skip: CancelFlag,
        shutdown: CancelFlag,
    ) -> Self {
        let supervisor = Self::supervisor_for(profile);

        let mut tokens: Vec<Arc<dyn CancellationToken>> = vec![Arc::new(skip)];
        if let Some(key) = profile.cancel_key {
            tokens.push(Arc::new(KeystrokeCancel::new(key)));
        }

        let retry = &profile.retry;
        Self {
            backend,
            supervisor,
            skip: Arc::new(AnyCancel::new(tokens)),
            shutdown,
            settle: Duration::from_millis(profile.settle_ms),
            sentinel: profile.sentinel.clone(),
            clear_retry: RetryPolicy::new(
                retry.clear_attempts,
                Backoff::Fixed(CLEAR_PAUSE),
            )
            .retry_if(|_| true),
            load_retry: RetryPolicy::new(
                retry.load_attempts,
                Backoff::Exponential(Duration::from_millis(retry.load_backoff_ms)),
            ),
            unload_retry: RetryPolicy::new(
                retry.unload_attempts,
                Backoff::Fixed(Duration::from_millis(retry.unload_backoff_ms)),
            ),
            setting_retry: RetryPolicy::new(
                retry.setting_attempts,
                Backoff::Linear(Duration::from_millis(retry.setting_backoff_ms)),
            ),
        }
    }

    /// Supervisor configured from the profile's `[supervisor]` section.
    pub fn supervisor_for(profile: &NormalizedProfile) -> ProcessSupervisor {
        let sup = &profile.supervisor;
        ProcessSupervisor::new(SupervisorPolicy {
            timeout: sup.timeout_secs.map(Duration::from_secs),
            poll_interval: Duration::from_millis(sup.poll_interval_ms),
            heartbeat_interval: Duration::from_secs(sup.heartbeat_secs),
            grace_period: Duration::from_secs(sup.grace_secs),
        })
    }

    #[must_use]
    pub fn with_skip(mut self, skip: Arc<dyn CancellationToken>) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    #[must_use]
    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token for one supervised step: re-arms `skip`, and also fires on
    /// shutdown.
    pub fn step_token(&self) -> StepToken<'_> {
        self.skip.reset();
        StepToken {
            skip: self.skip.as_ref(),
            shutdown: &self.shutdown,
        }
    }
}

pub struct StepToken<'a> {
    skip: &'a dyn CancellationToken,
    shutdown: &'a CancelFlag,
}

impl StepToken<'_> {
    /// True when the step was stopped by shutdown rather than a skip request.
    pub fn interrupted(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl CancellationToken for StepToken<'_> {
    fn is_cancelled(&self) -> bool {
        self.skip.is_cancelled() || self.shutdown.is_cancelled()
    }

    fn reset(&self) {
        self.skip.reset();
    }
}
