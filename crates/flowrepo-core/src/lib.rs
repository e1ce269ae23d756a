#![warn(missing_docs)]

//! flowrepo core: FlowFile records, content claims, record framing and configuration
//!
//! Every other flowrepo crate builds on these types. Nothing in here touches
//! the disk except [`RepositoryConfig::from_file`] and the framing helpers in
//! [`codec`], which operate on any `Read`/`Write`.

pub mod claim;
pub mod codec;
pub mod config;
pub mod error;
pub mod flowfile;
pub mod types;

pub use claim::{ContentClaim, ResourceClaim};
pub use codec::{encode_frame, read_raw_frame, write_frame, Frame, FrameReader, RawFrame};
pub use config::{
    ConnectionConfig, ContentConfig, LedgerConfig, PrioritizerKind, QueueSettings,
    RepositoryConfig, SyncMode,
};
pub use error::{CodecError, ConfigError};
pub use flowfile::{Attributes, FlowFileRecord, FILENAME_ATTRIBUTE, PRIORITY_ATTRIBUTE, UUID_ATTRIBUTE};
pub use types::{millis_after, now_millis, ConnectionId, FlowFileId};
