/// Error kinds per spec.md §7. The propagation policy lives at the call
/// site (DWS/UWS/patrol match on these to decide local recovery,
/// escalation, or rate-limited retry) rather than here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    /// The tenant cluster this item targeted has been removed from the
    /// registry. Reconcile is abandoned; the item is forgotten rather
    /// than retried.
    #[error("cluster '{0}' is no longer registered")]
    ClusterNotFound(String),

    /// The translated object is structurally impossible to build (e.g. a
    /// namespace name that would exceed Kubernetes' length limit).
    #[error("object cannot be translated: {0}")]
    ValidationError(String),

    /// No placement satisfies the namespace's request given current
    /// cluster capacity.
    #[error("scheduling is infeasible: {0}")]
    SchedulerInfeasible(String),

    /// A dependency (secret, service account, etc.) has not yet reached
    /// its readiness marker; caller should requeue after a short delay.
    #[error("dependency '{0}' is not ready")]
    DependencyNotReady(String),
}

impl Error {
    /// `true` for the small set of error kinds spec.md §7 says must not
    /// be retried at all.
    pub fn is_terminal_for_item(&self) -> bool {
        matches!(self, Error::ClusterNotFound(_) | Error::ValidationError(_))
    }
}
