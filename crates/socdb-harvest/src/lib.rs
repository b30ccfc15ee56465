pub mod controller;
pub mod error;
pub mod governor;
pub mod harvester;
pub mod memory;
pub mod policy;
pub mod resolve;
pub mod source;

pub use controller::run_harvest;
pub use error::{HarvestError, MalformedItemError, SourceError};
pub use governor::{Governor, GovernorConfig};
pub use harvester::{HarvestHandle, HarvestOptions, HarvestState, HarvestStatus, Harvester};
pub use memory::{MemoryStore, StoreCounts};
pub use policy::{BatchResult, Decision, TerminationPolicy};
pub use resolve::{HarvestTarget, IdentityResolver};
pub use source::{
    AnySource, ContinuationToken, CursorSource, HttpCursorEndpoint, PageSource, RawBatch, RawItem,
    ViewSource, ViewSnapshot,
};
