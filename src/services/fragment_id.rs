//! Deterministic fragment identities.
//!
//! A fragment id is a name-based (SHA-1, version 5) UUID of the string
//! `"<object_name>-<seq_num>"` under the nil namespace. The same inputs always
//! produce the same id, so identities can be regenerated without consulting
//! the manifest.

use uuid::Uuid;

/// Derive the content-addressing key for fragment `seq_num` of `object_name`.
pub fn fragment_id(object_name: &str, seq_num: u32) -> Uuid {
    Uuid::new_v5(&Uuid::nil(), format!("{}-{}", object_name, seq_num).as_bytes())
}
