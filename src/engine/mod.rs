//! Engine module housing run coordination and backend contracts.
//!
//! `coordinator` enforces single-flight runs and fans progress out to
//! observers, `subscriptions` filters that stream for consumers, and
//! `backend` defines the separation/decoding/draft-building contracts with
//! their built-in implementations.

pub mod backend;
pub mod coordinator;
pub mod subscriptions;

pub use backend::{
    select_separation_backend, DecodedAudio, Draft, DraftBuilder, DraftHit, DraftOptions,
    DraftOutcome, DraftTrack, PassthroughSeparation, PcmDecoder, ProgressCallback,
    SeparationBackend, SeparationCapability, SeparationOutput, SnapDraftBuilder, WavDecoder,
};
pub use coordinator::{RunCoordinator, RunHandle};
pub use subscriptions::{RunSubscription, StaleRunFilter};
