//! capgrid-scheduler — capacity reservation for compute and container
//! requests.
//!
//! A reservation turns "N instances of description D for tenants T" into a
//! committed claim on one capacity pool plus the hosts that will carry the
//! instances. Each request runs as a [`ReservationTask`] on the
//! `capgrid-task` runtime:
//!
//! ```text
//! ReservationScheduler::submit
//!   └── ReservationTask (capgrid-task instance)
//!       ├── ProfileResolver      network constraints, endpoint profiles
//!       ├── DescriptionEnhancer  per-profile description completion
//!       ├── CapacityPoolStore    pool query, tags, conditional commit
//!       └── PlacementSelector    host selection (capgrid-placement)
//! ```
//!
//! Collaborators are traits; [`store_backed::collaborators`] wires them to
//! a local [`StateStore`](capgrid_state::StateStore).

pub mod collaborators;
pub mod enhancer;
pub mod error;
pub mod request;
pub mod reservation;
pub mod service;
pub mod store_backed;

pub use collaborators::{
    CapacityPoolStore, CollaboratorResult, Collaborators, DescriptionCache, DescriptionEnhancer,
    DescriptionStore, HostSelectionRequest, PlacementSelector, ProfileEntry, ProfileResolver,
};
pub use enhancer::{EnhancementStage, EnhancerChain};
pub use error::{CollaboratorError, ErrorClass, ReservationError};
pub use request::ReservationRequest;
pub use reservation::{
    CandidatePool, RejectedPool, ReservationBody, ReservationOutput, ReservationSubStage,
    ReservationTask, stage_table,
};
pub use service::{ReservationCompletion, ReservationScheduler, supervise};
pub use store_backed::{StoreCollaborators, collaborators};
