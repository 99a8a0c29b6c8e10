//! Sequential load driver for a paginated product-search endpoint.
//!
//! A run sweeps `pages` consecutive pages `repeat` times, one request at a
//! time, and turns every response (or transport failure) into an
//! [`observation::Observation`] labelled with its page, size, brand and sort
//! mode. Aggregation happens outside the request loop in [`report`].

pub mod cli;
pub mod config;
pub mod driver;
pub mod http;
pub mod observation;
pub mod plan;
pub mod report;
pub mod request;
pub mod telemetry;

pub use config::{ConfigError, RunConfig, SortMode};
pub use driver::{Execution, LoadDriver, Pacer, ThreadPacer};
pub use http::{BlockingSearchHttp, HttpOutcome, SearchHttp};
pub use observation::{Observation, validate};
pub use plan::{IterationIndex, RunCursor, next_page, total_iterations};
pub use report::{RunSummary, SummaryBuilder};
pub use request::{RequestLabel, SearchRequest, build_url};
