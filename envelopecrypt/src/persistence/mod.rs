//! Adapters for the application-side persistence helpers used by sessions.
//!
//! `Session::load`/`Session::store` adapt to an external persistence collaborator (a database
//! row, a file, ...) that is out of scope for this crate; `LoaderFn`/`StorerFn` let a caller
//! plug in that collaborator as a plain closure instead of implementing `Loader`/`Storer`.

mod functions;

pub use functions::{LoaderFn, StorerFn};
