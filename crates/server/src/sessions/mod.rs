//! Upload session lifecycle: admission, offset protocol, completion and
//! background reconciliation.

pub mod admission;
pub mod completion;
pub mod error;
pub mod locks;
pub mod protocol;
pub mod reconciler;

pub use admission::{AdmissionController, SlotStatus};
pub use completion::{
    CompletionLinker, CompletionOutcome, LinkError, LinkRequest, LinkedResource, ResourceLinker,
};
pub use error::{UploadError, UploadResult};
pub use locks::SessionLocks;
pub use protocol::{AppendOutcome, CancelOutcome, UploadProtocol};
pub use reconciler::{ReconcileStats, Reconciler};
