//! Step model and lazy step builders
//!
//! - [`Step`] and [`StepKind`]: the replayable history entry
//! - [`RawStep`]: the base64 envelope a continuation request carries
//! - [`LazyStep`] implementations, one per step type

mod lazy;
mod model;

pub use lazy::{
    BoxedLazyStep, LazyCallStep, LazyRunStep, LazySleepStep, LazySleepUntilStep, LazyStep,
};
pub use model::{CallRequest, CallType, RawStep, Step, StepKind, StepType, NO_CONCURRENCY};
