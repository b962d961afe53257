//! Bundle Manager Builder API
//!
//! Collects the store, configuration and collaborators for a
//! [`BundleManager`] and starts it.

use crate::manager::{BundleManager, ManagerParts};
use bundlekit_core::{
    BundleConfig, BundleError, BundleResult, Bundler, EventLogger, FailureHandler,
    NoOpLogger, NoUpdateNotifier, PackageDescriptor, PropagateFailure, TracingLogger,
    UpdateNotifier, VersionedStore,
};
use std::sync::Arc;
use tracing::info;

// ----------------------------------------------------------------------------
// Bundle Manager Builder
// ----------------------------------------------------------------------------

/// Builder for a [`BundleManager`]
pub struct BundleManagerBuilder {
    store: Arc<dyn VersionedStore>,
    config: BundleConfig,
    package: Option<Vec<u8>>,
    logger: Arc<dyn EventLogger>,
    failure: Arc<dyn FailureHandler>,
    notifier: Option<Arc<dyn UpdateNotifier>>,
    bundler: Option<Arc<dyn Bundler>>,
}

impl BundleManagerBuilder {
    /// Start from `store` with the default configuration, a silent logger and
    /// failures propagated to the caller
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self {
            store,
            config: BundleConfig::default(),
            package: None,
            logger: Arc::new(NoOpLogger),
            failure: Arc::new(PropagateFailure),
            notifier: None,
            bundler: None,
        }
    }

    pub fn with_config(mut self, config: BundleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Route bundle events through `tracing`
    pub fn with_tracing_logger(self) -> Self {
        self.with_logger(Arc::new(TracingLogger))
    }

    pub fn with_failure_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure = handler;
        self
    }

    /// Receive release updates; enables the update watch
    pub fn with_update_notifier(mut self, notifier: Arc<dyn UpdateNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_bundler(mut self, bundler: Arc<dyn Bundler>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    /// Raw `package.json` contents, parsed on build
    pub fn with_package_descriptor(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.package = Some(bytes.into());
        self
    }

    /// Validate the configuration and start the manager
    ///
    /// The store begins opening immediately. Must be called from within a
    /// tokio runtime.
    pub fn build(self) -> BundleResult<BundleManager> {
        self.config.validate().map_err(BundleError::config_error)?;
        let package = self
            .package
            .as_deref()
            .map(PackageDescriptor::parse)
            .transpose()?;

        let mut config = self.config;
        if self.notifier.is_some() {
            config.watch_updates = true;
        }

        info!(
            key = ?config.key.map(|key| key.to_hex()),
            checkout = ?config.checkout,
            "Starting bundle manager"
        );

        Ok(BundleManager::start(ManagerParts {
            config,
            store: self.store,
            package,
            logger: self.logger,
            failure: self.failure,
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(NoUpdateNotifier)),
            bundler: self.bundler,
        }))
    }
}

impl BundleManager {
    pub fn builder(store: Arc<dyn VersionedStore>) -> BundleManagerBuilder {
        BundleManagerBuilder::new(store)
    }
}
