//! The pub/sub message envelope: the `(channel, msg)` pair carried by a
//! publication, plus the metadata-attachment mechanism of spec.md §4.H.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

type OnFinish = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

struct MetadataRecord {
    record: Option<Box<dyn Any + Send>>,
    on_finish: Option<OnFinish>,
}

struct Inner {
    channel: Box<[u8]>,
    payload: Box<[u8]>,
    is_json: bool,
    metadata: Mutex<HashMap<u32, MetadataRecord>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // All deliveries holding a clone of the surrounding `Arc` have
        // gone out of scope by the time this runs, so every metadata
        // record's `on_finish` fires exactly once, after the last
        // delivery completes (spec.md §4.H).
        for (_, mut entry) in self.metadata.get_mut().drain() {
            if let (Some(on_finish), Some(record)) = (entry.on_finish.take(), entry.record.take()) {
                on_finish(record);
            }
        }
    }
}

/// A ref-counted, cloned-per-delivery publication.
///
/// Each matched subscription's deferred delivery task holds a clone of
/// this handle; when the last clone drops, any attached metadata records
/// are released via their `on_finish` hook.
#[derive(Clone)]
pub struct Message(Arc<Inner>);

impl Message {
    pub fn new(channel: Vec<u8>, payload: Vec<u8>, is_json: bool) -> Message {
        Message(Arc::new(Inner {
            channel: channel.into_boxed_slice(),
            payload: payload.into_boxed_slice(),
            is_json,
            metadata: Mutex::new(HashMap::new()),
        }))
    }

    pub fn channel(&self) -> &[u8] {
        &self.0.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.0.payload
    }

    pub fn is_json(&self) -> bool {
        self.0.is_json
    }

    /// Attaches a typed metadata record, replacing any prior record under
    /// the same `type_id`. Invoked by a registered `metadata_fn` once per
    /// publication, before delivery (spec.md §4.H).
    pub fn attach_metadata(
        &self,
        type_id: u32,
        record: Box<dyn Any + Send>,
        on_finish: impl FnOnce(Box<dyn Any + Send>) + Send + 'static,
    ) {
        self.0.metadata.lock().insert(
            type_id,
            MetadataRecord {
                record: Some(record),
                on_finish: Some(Box::new(on_finish)),
            },
        );
    }

    /// Retrieves the metadata record attached under `type_id`, if any.
    /// `F` lets a consumer downcast without cloning the record out.
    pub fn with_metadata<F, R>(&self, type_id: u32, f: F) -> Option<R>
    where
        F: FnOnce(&(dyn Any + Send)) -> R,
    {
        let guard = self.0.metadata.lock();
        guard.get(&type_id).and_then(|entry| entry.record.as_deref().map(f))
    }
}
