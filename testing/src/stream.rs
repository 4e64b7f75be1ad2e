//! In-memory record stream with cursor tracking.

use settlematch_core::key::PartitionId;
use settlematch_core::record::{Offset, RawRecord};
use settlematch_core::stream_source::{RecordStream, StreamError};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    queue: VecDeque<RawRecord>,
    cursor: Option<Offset>,
    next_offset: u64,
}

/// Vec-backed [`RecordStream`] for one partition.
///
/// Records pushed with [`VecRecordStream::push`] get consecutive offsets;
/// [`VecRecordStream::push_record`] delivers an explicit record, which is
/// how tests simulate redelivery of an unacknowledged offset.
pub struct VecRecordStream {
    partition: PartitionId,
    inner: Mutex<Inner>,
}

impl VecRecordStream {
    /// Create an empty stream partition.
    #[must_use]
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a stream preloaded with payloads at consecutive offsets.
    #[must_use]
    pub fn with_payloads(partition: PartitionId, payloads: Vec<Vec<u8>>) -> Self {
        let stream = Self::new(partition);
        for payload in payloads {
            stream.push(payload);
        }
        stream
    }

    /// Append a payload at the next offset and return that offset.
    pub fn push(&self, payload: Vec<u8>) -> Offset {
        let mut inner = self.lock();
        let offset = Offset::new(inner.next_offset);
        inner.next_offset += 1;
        inner
            .queue
            .push_back(RawRecord::new(self.partition, offset, payload));
        offset
    }

    /// Deliver an explicit record (redelivery simulation).
    pub fn push_record(&self, record: RawRecord) {
        let mut inner = self.lock();
        inner.next_offset = inner.next_offset.max(record.offset.value() + 1);
        inner.queue.push_back(record);
    }

    /// The acknowledged cursor, without going through the trait.
    #[must_use]
    pub fn acked(&self) -> Option<Offset> {
        self.lock().cursor
    }

    /// Number of records not yet fetched.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::unwrap_used)] // Mutex poisoning only follows a panicked test
        self.inner.lock().unwrap()
    }
}

impl RecordStream for VecRecordStream {
    fn next(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawRecord>, StreamError>> + Send + '_>> {
        Box::pin(async move { Ok(self.lock().queue.pop_front()) })
    }

    fn ack(
        &self,
        offset: Offset,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.lock();
            // The cursor is a high-watermark; it never moves backwards.
            if inner.cursor.is_none_or(|cursor| offset > cursor) {
                inner.cursor = Some(offset);
            }
            Ok(())
        })
    }

    fn cursor(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Offset>, StreamError>> + Send + '_>> {
        Box::pin(async move { Ok(self.lock().cursor) })
    }
}
