use std::hash::Hash;

use serde::{de::DeserializeOwned, Serialize};

use super::Data;

/// Data which may be used as a key for keyed state.
///
/// Keys must be serializable, since they are persisted in checkpoints, and `Sync`, since the
/// state store updates disjoint keys from multiple threads.
#[diagnostic::on_unimplemented(
    message = "Type must be `Data + Hash + Eq + Sync + Serialize + DeserializeOwned` to be used as a key"
)]
pub trait Key: Data + Hash + Eq + Sync + Serialize + DeserializeOwned {}
impl<T: Data + Hash + Eq + Sync + Serialize + DeserializeOwned> Key for T {}
