pub mod catalog;
pub mod domain;
pub mod generation;
pub mod illustrate;
pub mod ledger;
pub mod memory;
pub mod ports;
pub mod recovery;
pub mod retry;
pub mod scenes;
pub mod story;
pub mod studio;
pub mod variants;

pub use catalog::BookRequest;
pub use domain::{
    AuthSession, Book, BookDetail, BookParams, BookStatus, GenerationJob, JobStatus, LedgerEntry,
    Page, PageImage, PointHistory, PointReason, SamplerParams, User, UserCredentials,
};
pub use ledger::Pricing;
pub use ports::{
    DatabaseService, ImageGenerationService, ObjectStorage, PortError, PortResult,
    TextGenerationService,
};
pub use recovery::{BookLocator, JobMarker, MarkerStore, RecoveryGuard, RecoveryOutcome};
pub use retry::RetryPolicy;
pub use studio::{BookStudio, StudioSettings};
pub use variants::{CandidateTray, RefinedImage};
