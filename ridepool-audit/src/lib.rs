pub mod anchor;
pub mod canonical;
pub mod log;

pub use anchor::{anchors_match, HmacSealer, DEFAULT_KEY_VERSION};
pub use canonical::{canonical_bytes, entry_hash};
pub use log::IntegrityLog;
