//! Represents an object manifest: the ordered set of fragments an object is split into.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single fragment record inside an object manifest.
///
/// A fragment is one contiguous byte range of exactly one object and lives
/// on exactly one storage node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FragmentMeta {
    /// 0-based position of this fragment; defines reassembly order.
    pub seq_num: u32,

    /// Storage node that received the fragment at write time.
    pub server_id: Uuid,

    /// Content-addressing key derived from (object name, seq_num).
    pub fragment_id: Uuid,

    /// Byte length of the fragment.
    pub size: u64,
}

/// The manifest of an object: its name and the fragments that make it up.
///
/// `fragments` is not guaranteed to be in `seq_num` order when loaded from a
/// repository; readers must sort before reassembling.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Unique object name.
    pub name: String,

    pub fragments: Vec<FragmentMeta>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, fragments: Vec<FragmentMeta>) -> Self {
        Self {
            name: name.into(),
            fragments,
        }
    }

    /// Total object size, the sum of all fragment sizes.
    pub fn total_size(&self) -> u64 {
        self.fragments.iter().map(|f| f.size).sum()
    }

    /// Sort fragments ascending by `seq_num`.
    pub fn sort_fragments(&mut self) {
        self.fragments.sort_by_key(|f| f.seq_num);
    }
}
