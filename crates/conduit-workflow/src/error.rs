use conduit_billing::BillingError;
use conduit_store::StoreError;
use conduit_upstream::UpstreamError;

/// Errors raised while assembling or configuring the pipeline
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Two steps share a name
    #[error("step '{0}' is registered twice")]
    DuplicateStep(&'static str),

    /// A step depends on a step that is not registered
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// Dependent step
        step: &'static str,
        /// Missing dependency
        dependency: &'static str,
    },

    /// Step dependencies cannot be ordered
    #[error("step dependencies form a cycle through: {}", .0.join(", "))]
    DependencyCycle(Vec<&'static str>),

    /// Route configuration cannot be turned into candidates
    #[error("invalid route: {0}")]
    Route(String),

    /// Secret key is not of the form `provider/secret_ref`
    #[error("invalid secret key '{0}', expected provider/secret_ref")]
    SecretKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Billing(#[from] BillingError),
}
