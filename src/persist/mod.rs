//! Resumable run state, JSONL sinks, and shard partitioning.

pub mod records;
pub mod runstate;
pub mod shard;

pub use records::{like_signature, note_id_from_url, CommentRecord, LikeLedger, LinkRecord};
pub use runstate::{keyword_dir, CollectState, RunStatus};
pub use shard::{ShardBy, ShardSpec};
