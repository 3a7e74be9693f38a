//! dronegrid-dispatcher — the single-threaded scheduler loop.
//!
//! One [`Dispatcher`] owns the state store handle, the drone manager, the
//! cleanup passes and the reload-able configuration. `run` executes one
//! tick at a time; nothing else mutates host or queue state.
//!
//! # Tick
//!
//! ```text
//! reconfigure requests ─► drone refresh ─► completions ─► aborts
//!        ─► periodic cleanup ─► schedule ─► dispatch ─► drone actions
//!        ─► notification emails ─► status snapshot
//! ```
//!
//! Every drone call made during a tick is bounded by the tick deadline
//! (`tick_timeout_secs`), so an unresponsive drone delays scheduling by at
//! most one deadline.

pub mod dispatcher;
pub mod error;

pub use dispatcher::{Dispatcher, execution_tag};
pub use error::{DispatchError, DispatchResult};
