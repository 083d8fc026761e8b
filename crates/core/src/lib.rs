pub mod establishment;
pub mod job;
pub mod retry;
pub mod siret;

pub use establishment::{
    normalize_fiscal_years, Address, AssociationAttributes, AttributesError, Entreprise,
    EntrepriseAttributes, Establishment, FiscalYear,
};
pub use job::{JobKind, JobStatus, SyncJob, UnknownValue};
pub use retry::{Backoff, FailureClass, RetryDecision, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use siret::{Siret, SiretError};
