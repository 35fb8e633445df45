use std::any::type_name;
use std::fmt;
use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;

use crate::rejection::log_unhandled;
use crate::{
    SynchronizationContext, SystemTimerFactory, ThreadPoolContext, TimerFactory,
    UnhandledRejection,
};

const DEFAULT_MAX_POOLED_PER_TYPE: usize = 256;

/// Receives rejections that were dropped without any stage of their promise chain handling them.
pub type UnhandledRejectionHandler = Arc<dyn Fn(&UnhandledRejection) + Send + Sync>;

static CURRENT: LazyLock<ArcSwap<Config>> =
    LazyLock::new(|| ArcSwap::from_pointee(ConfigBuilder::new().build()));

/// Returns the currently installed configuration.
pub(crate) fn current() -> Arc<Config> {
    CURRENT.load_full()
}

/// Whether node pooling is enabled and, if so, how many nodes of one type each thread keeps.
pub(crate) fn pool_capacity() -> Option<usize> {
    let config = CURRENT.load();

    config
        .object_pooling_enabled
        .then_some(config.max_pooled_per_type)
}

/// Process-wide settings of the promise runtime.
///
/// The configuration is read whenever the runtime needs one of its settings, so installing a new
/// configuration affects all operations started afterwards. Operations already in progress keep
/// whatever they have already resolved from the previous configuration.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use proto_promise::{Config, ManualSynchronizationContext};
///
/// let main_loop = Arc::new(ManualSynchronizationContext::new());
///
/// Config::builder()
///     .foreground_context(main_loop.clone())
///     .max_pooled_per_type(64)
///     .install();
/// ```
pub struct Config {
    foreground_context: Option<Arc<dyn SynchronizationContext>>,
    background_context: Arc<dyn SynchronizationContext>,
    timer_factory: Arc<dyn TimerFactory>,
    unhandled_rejection_handler: UnhandledRejectionHandler,
    object_pooling_enabled: bool,
    max_pooled_per_type: usize,
}

impl Config {
    /// Starts building a new configuration, beginning from the default settings.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Returns the currently installed configuration.
    #[must_use]
    pub fn current() -> Arc<Self> {
        current()
    }

    /// The context used by [`SynchronizationOption::Foreground`], if one is configured.
    ///
    /// [`SynchronizationOption::Foreground`]: crate::SynchronizationOption::Foreground
    #[must_use]
    pub fn foreground_context(&self) -> Option<&Arc<dyn SynchronizationContext>> {
        self.foreground_context.as_ref()
    }

    /// The context used by [`SynchronizationOption::Background`].
    ///
    /// [`SynchronizationOption::Background`]: crate::SynchronizationOption::Background
    #[must_use]
    pub fn background_context(&self) -> &Arc<dyn SynchronizationContext> {
        &self.background_context
    }

    /// The factory used to create timers for timeouts.
    #[must_use]
    pub fn timer_factory(&self) -> &Arc<dyn TimerFactory> {
        &self.timer_factory
    }

    /// The handler that receives unhandled rejections.
    #[must_use]
    pub fn unhandled_rejection_handler(&self) -> UnhandledRejectionHandler {
        Arc::clone(&self.unhandled_rejection_handler)
    }

    /// Whether promise nodes are pooled for reuse.
    #[must_use]
    pub fn object_pooling_enabled(&self) -> bool {
        self.object_pooling_enabled
    }

    /// The maximum number of idle nodes of one type that each thread keeps for reuse.
    #[must_use]
    pub fn max_pooled_per_type(&self) -> usize {
        self.max_pooled_per_type
    }
}

impl fmt::Debug for Config {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("has_foreground_context", &self.foreground_context.is_some())
            .field("object_pooling_enabled", &self.object_pooling_enabled)
            .field("max_pooled_per_type", &self.max_pooled_per_type)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Config`].
///
/// Obtain one via [`Config::builder()`].
#[must_use]
pub struct ConfigBuilder {
    foreground_context: Option<Arc<dyn SynchronizationContext>>,
    background_context: Option<Arc<dyn SynchronizationContext>>,
    timer_factory: Option<Arc<dyn TimerFactory>>,
    unhandled_rejection_handler: Option<UnhandledRejectionHandler>,
    object_pooling_enabled: bool,
    max_pooled_per_type: usize,
}

impl ConfigBuilder {
    fn new() -> Self {
        Self {
            foreground_context: None,
            background_context: None,
            timer_factory: None,
            unhandled_rejection_handler: None,
            object_pooling_enabled: true,
            max_pooled_per_type: DEFAULT_MAX_POOLED_PER_TYPE,
        }
    }

    /// Sets the context that [`SynchronizationOption::Foreground`] schedules onto.
    ///
    /// There is no default. Using the foreground option without configuring a context is a
    /// usage error.
    ///
    /// [`SynchronizationOption::Foreground`]: crate::SynchronizationOption::Foreground
    pub fn foreground_context(mut self, context: Arc<dyn SynchronizationContext>) -> Self {
        self.foreground_context = Some(context);
        self
    }

    /// Sets the context that [`SynchronizationOption::Background`] schedules onto.
    ///
    /// Defaults to a [`ThreadPoolContext`] that starts its threads on first use.
    ///
    /// [`SynchronizationOption::Background`]: crate::SynchronizationOption::Background
    pub fn background_context(mut self, context: Arc<dyn SynchronizationContext>) -> Self {
        self.background_context = Some(context);
        self
    }

    /// Sets the factory used to create timers for timeouts.
    ///
    /// Defaults to a [`SystemTimerFactory`].
    pub fn timer_factory(mut self, factory: Arc<dyn TimerFactory>) -> Self {
        self.timer_factory = Some(factory);
        self
    }

    /// Sets the handler that receives rejections that no stage of a promise chain handled.
    ///
    /// The default handler logs the rejection via `tracing::error!`. A panic inside the handler
    /// is caught and logged.
    pub fn unhandled_rejection_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&UnhandledRejection) + Send + Sync + 'static,
    {
        self.unhandled_rejection_handler = Some(Arc::new(handler));
        self
    }

    /// Enables or disables reuse of promise nodes. Enabled by default.
    pub fn object_pooling(mut self, enabled: bool) -> Self {
        self.object_pooling_enabled = enabled;
        self
    }

    /// Sets how many idle nodes of one type each thread keeps for reuse. Defaults to 256.
    pub fn max_pooled_per_type(mut self, max: usize) -> Self {
        self.max_pooled_per_type = max;
        self
    }

    /// Builds the configuration without installing it.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            foreground_context: self.foreground_context,
            background_context: self
                .background_context
                .unwrap_or_else(|| Arc::new(ThreadPoolContext::new())),
            timer_factory: self
                .timer_factory
                .unwrap_or_else(|| Arc::new(SystemTimerFactory::new())),
            unhandled_rejection_handler: self
                .unhandled_rejection_handler
                .unwrap_or_else(|| Arc::new(log_unhandled)),
            object_pooling_enabled: self.object_pooling_enabled,
            max_pooled_per_type: self.max_pooled_per_type,
        }
    }

    /// Builds the configuration and installs it as the process-wide configuration.
    pub fn install(self) {
        CURRENT.store(Arc::new(self.build()));
    }
}

impl fmt::Debug for ConfigBuilder {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("has_foreground_context", &self.foreground_context.is_some())
            .field("object_pooling_enabled", &self.object_pooling_enabled)
            .field("max_pooled_per_type", &self.max_pooled_per_type)
            .finish_non_exhaustive()
    }
}
