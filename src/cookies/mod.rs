//! Cookie persistence: snapshot model, stability-windowed store, autosave.

pub mod autosave;
pub mod snapshot;
pub mod store;

pub use autosave::Autosaver;
pub use snapshot::{equivalent, projection, Cookie};
pub use store::{CookieStore, SaveOutcome};
