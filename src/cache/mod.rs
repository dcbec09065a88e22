pub mod context;
pub mod control;
pub mod entry;
pub mod event;
pub mod key;

pub use context::{CachePolicy, Context};
pub use entry::{StoredEntry, X_CONTENT_DIGEST, status_cacheable_by_default};
pub use event::{Event, EventSet};
pub use key::CacheKey;
