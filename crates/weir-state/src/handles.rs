use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Anything that refers to checkpointed state and can release the storage behind it.
pub trait StateObject {
    /// Releases the underlying storage. Discarding state that is already gone is not an error.
    fn discard_state(&self) -> anyhow::Result<()>;

    /// Size of the referenced state in bytes.
    fn state_size(&self) -> u64;
}

/// A handle to a stream of serialized state bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamStateHandle {
    /// Small state that travels inline with the acknowledgment.
    Bytes { name: String, data: Bytes },
    /// State written to a file by the task before acknowledging.
    File { path: PathBuf, size: u64 },
}

impl StreamStateHandle {
    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        StreamStateHandle::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn file(path: impl Into<PathBuf>, size: u64) -> Self {
        StreamStateHandle::File {
            path: path.into(),
            size,
        }
    }
}

impl StateObject for StreamStateHandle {
    fn discard_state(&self) -> anyhow::Result<()> {
        match self {
            StreamStateHandle::Bytes { .. } => Ok(()),
            StreamStateHandle::File { path, .. } => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
            },
        }
    }

    fn state_size(&self) -> u64 {
        match self {
            StreamStateHandle::Bytes { data, .. } => data.len() as u64,
            StreamStateHandle::File { size, .. } => *size,
        }
    }
}

/// Redistributable operator state: one stream plus the offsets of each named partition in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStateHandle {
    pub partition_offsets: BTreeMap<String, Vec<u64>>,
    pub delegate: StreamStateHandle,
}

impl OperatorStateHandle {
    pub fn new(partition_offsets: BTreeMap<String, Vec<u64>>, delegate: StreamStateHandle) -> Self {
        Self {
            partition_offsets,
            delegate,
        }
    }
}

impl StateObject for OperatorStateHandle {
    fn discard_state(&self) -> anyhow::Result<()> {
        self.delegate.discard_state()
    }

    fn state_size(&self) -> u64 {
        self.delegate.state_size()
    }
}

/// An inclusive range of key groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGroupRange {
    pub start: u32,
    pub end: u32,
}

impl KeyGroupRange {
    pub fn of(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key_group: u32) -> bool {
        self.start <= key_group && key_group <= self.end
    }
}

/// Keyed state for a contiguous range of key groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGroupsStateHandle {
    pub key_groups: KeyGroupRange,
    pub delegate: StreamStateHandle,
}

impl KeyGroupsStateHandle {
    pub fn new(key_groups: KeyGroupRange, delegate: StreamStateHandle) -> Self {
        Self {
            key_groups,
            delegate,
        }
    }
}

impl StateObject for KeyGroupsStateHandle {
    fn discard_state(&self) -> anyhow::Result<()> {
        self.delegate.discard_state()
    }

    fn state_size(&self) -> u64 {
        self.delegate.state_size()
    }
}

/// One optional handle per operator of a chain, in chain order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedStateHandle<T> {
    handles: Vec<Option<T>>,
}

impl<T> ChainedStateHandle<T> {
    pub fn new(handles: Vec<Option<T>>) -> Self {
        Self { handles }
    }

    pub fn wrap_single(handle: T) -> Self {
        Self {
            handles: vec![Some(handle)],
        }
    }

    /// Number of operators in the chain, including those without state.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when no operator of the chain holds state.
    pub fn is_empty(&self) -> bool {
        self.handles.iter().all(Option::is_none)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.handles.get(index).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.handles.iter().flatten()
    }
}

impl<T: StateObject> StateObject for ChainedStateHandle<T> {
    fn discard_state(&self) -> anyhow::Result<()> {
        discard_all(self.iter())
    }

    fn state_size(&self) -> u64 {
        self.iter().map(StateObject::state_size).sum()
    }
}

/// Discards every object, continuing past failures; returns the first failure.
pub(crate) fn discard_all<'a, S: StateObject + 'a>(
    objects: impl IntoIterator<Item = &'a S>,
) -> anyhow::Result<()> {
    let mut first_error = None;
    for object in objects {
        if let Err(e) = object.discard_state() {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_handle_discard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chk-1-op-0");
        std::fs::write(&path, b"state").unwrap();

        let handle = StreamStateHandle::file(&path, 5);
        assert_eq!(handle.state_size(), 5);

        handle.discard_state().unwrap();
        assert!(!path.exists());

        // already gone
        handle.discard_state().unwrap();
    }

    #[test]
    fn test_chained_handle() {
        let chain = ChainedStateHandle::new(vec![
            None,
            Some(StreamStateHandle::bytes("op-1", vec![1u8, 2, 3])),
            Some(StreamStateHandle::bytes("op-2", vec![4u8])),
        ]);

        assert_eq!(chain.len(), 3);
        assert!(!chain.is_empty());
        assert!(chain.get(0).is_none());
        assert_eq!(chain.state_size(), 4);

        let empty: ChainedStateHandle<StreamStateHandle> = ChainedStateHandle::new(vec![None, None]);
        assert_eq!(empty.len(), 2);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_discard_all_continues_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        std::fs::write(&good, b"x").unwrap();

        // a directory can't be removed with remove_file
        let bad = StreamStateHandle::file(dir.path(), 1);
        let handles = vec![bad, StreamStateHandle::file(&good, 1)];

        assert!(discard_all(handles.iter()).is_err());
        assert!(!good.exists());
    }

    #[test]
    fn test_key_group_range() {
        let range = KeyGroupRange::of(4, 7);
        assert_eq!(range.len(), 4);
        assert!(range.contains(4));
        assert!(range.contains(7));
        assert!(!range.contains(8));
        assert!(KeyGroupRange::of(3, 2).is_empty());
    }
}
