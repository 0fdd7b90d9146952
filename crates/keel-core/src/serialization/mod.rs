//! Project documents: archives over `serde_json`, the registry of persistable
//! state types, safe anchors, and the manager tying them together.

pub mod anchor;
pub mod archive;
pub mod manager;
pub mod types;

pub use anchor::{SafeAnchor, TaggedSafeAnchor};
pub use archive::{InputArchive, OutputArchive, FORMAT_VERSION, SUPPORTED_FORMAT};
pub use manager::{InvalidityList, SerializationManager};
pub use types::StateTypeRegistry;
