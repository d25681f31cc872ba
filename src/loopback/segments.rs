//! memfd-backed shared segments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::AddressMap;
use crate::error::{Error, Result};
use crate::memory::{MemorySegment, SharedMemorySegment};
use crate::runtime::{Attachment, SegmentId, SegmentKey, SegmentProvider};

#[derive(Default)]
struct Table {
    next: u64,
    segments: HashMap<u64, Arc<SharedMemorySegment>>,
    /// Remote-side mappings, by the DMA address they are registered at.
    attachments: HashMap<u64, SharedMemorySegment>,
}

/// [`SegmentProvider`] creating one memfd per segment.
///
/// `create` maps the memfd for the local role. `attach` maps it a second
/// time and registers that mapping in the address map, so the loopback
/// DMA engine and word access reach the same pages.
pub struct MemfdSegments {
    map: Arc<AddressMap>,
    table: Mutex<Table>,
}

impl MemfdSegments {
    /// A provider registering attachments in `map`.
    pub fn new(map: Arc<AddressMap>) -> Self {
        Self {
            map,
            table: Mutex::new(Table::default()),
        }
    }

    /// Segments created and not yet destroyed.
    pub fn live_segments(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .segments
            .len()
    }

    /// Attachments not yet detached.
    pub fn live_attachments(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attachments
            .len()
    }
}

impl SegmentProvider for MemfdSegments {
    fn create(&self, key: SegmentKey, size: usize) -> Result<(SegmentId, Arc<dyn MemorySegment>)> {
        let segment = Arc::new(SharedMemorySegment::new(&format!("udma-{}", key.0), size)?);
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.next += 1;
        let id = table.next;
        table.segments.insert(id, segment.clone());
        debug!("created segment {} (key {}, {} bytes)", id, key.0, size);
        let local: Arc<dyn MemorySegment> = segment;
        Ok((SegmentId(id), local))
    }

    fn attach(&self, id: SegmentId) -> Result<Attachment> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let segment = table
            .segments
            .get(&id.0)
            .ok_or_else(|| Error::InvalidSegment(format!("segment {id} does not exist")))?;
        let mapping = segment.duplicate()?;
        let base = self.map.register(mapping.as_mut_ptr(), mapping.len());
        let attachment = Attachment {
            base,
            len: mapping.len(),
        };
        table.attachments.insert(base.0, mapping);
        Ok(attachment)
    }

    fn detach(&self, id: SegmentId, attachment: Attachment) -> Result<()> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.attachments.remove(&attachment.base.0).is_none() {
            return Err(Error::InvalidSegment(format!(
                "segment {id} is not attached at {}",
                attachment.base
            )));
        }
        self.map.unregister(attachment.base)
    }

    fn destroy(&self, id: SegmentId) -> Result<()> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .segments
            .remove(&id.0)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidSegment(format!("segment {id} does not exist")))
    }
}

impl std::fmt::Debug for MemfdSegments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemfdSegments")
            .field("live_segments", &self.live_segments())
            .field("live_attachments", &self.live_attachments())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackWords;
    use crate::runtime::WordAccess;

    #[test]
    fn test_attachment_aliases_local_mapping() {
        let map = Arc::new(AddressMap::new());
        let segments = MemfdSegments::new(map.clone());
        let (id, local) = segments.create(SegmentKey(5), 4096).unwrap();

        let attachment = segments.attach(id).unwrap();
        assert_eq!(attachment.len, 4096);
        let words = LoopbackWords::new(map.clone());
        words.store_word(attachment.base.offset(8), 77).unwrap();
        let local_word = unsafe { &local.as_slice()[8..16] };
        assert_eq!(local_word, &77u64.to_ne_bytes());

        segments.detach(id, attachment).unwrap();
        assert!(segments.detach(id, attachment).is_err());
        assert_eq!(map.regions(), 0);
        segments.destroy(id).unwrap();
        assert_eq!(segments.live_segments(), 0);
    }

    #[test]
    fn test_attach_unknown_segment() {
        let segments = MemfdSegments::new(Arc::new(AddressMap::new()));
        assert!(segments.attach(SegmentId(42)).is_err());
        assert!(segments.destroy(SegmentId(42)).is_err());
    }
}
