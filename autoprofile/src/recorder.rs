use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context as _;
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;

/// Receives finished profiles in their serialized form.
pub trait Recorder: Send + Sync {
    fn record(&self, profile: Value);
}

/// Destination of flushed profile batches.
pub trait ProfileSink: Send + Sync {
    fn send(&self, profiles: &[Value]) -> anyhow::Result<()>;
}

impl<F> ProfileSink for F
where
    F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync,
{
    fn send(&self, profiles: &[Value]) -> anyhow::Result<()> {
        self(profiles)
    }
}

/// Queues recorded profiles until the next flush. When the queue is over
/// capacity the oldest profiles are dropped.
pub struct BufferedRecorder {
    max_buffered: usize,
    queue: Mutex<VecDeque<Value>>,
    sink: Box<dyn ProfileSink>,
}

impl BufferedRecorder {
    /// `max_buffered == 0` turns recording off.
    pub fn new(max_buffered: usize, sink: impl ProfileSink + 'static) -> Self {
        BufferedRecorder {
            max_buffered,
            queue: Mutex::new(VecDeque::new()),
            sink: Box::new(sink),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Hands everything queued to the sink. A failed batch goes back to the
    /// front of the queue, ahead of profiles recorded in the meantime.
    pub fn flush(&self) {
        let outgoing: Vec<Value> = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };

        match self.sink.send(&outgoing) {
            Ok(()) => debug!("flushed {} profiles", outgoing.len()),
            Err(err) => {
                error!("failed to send profiles: {err:#}");
                let mut queue = self.queue.lock();
                for profile in outgoing.into_iter().rev() {
                    queue.push_front(profile);
                }
                Self::truncate(&mut queue, self.max_buffered);
            }
        }
    }

    fn truncate(queue: &mut VecDeque<Value>, max_buffered: usize) {
        let excess = queue.len().saturating_sub(max_buffered);
        if excess > 0 {
            queue.drain(..excess);
            warn!("profile queue is full, dropped {excess} oldest profiles");
        }
    }
}

impl Recorder for BufferedRecorder {
    fn record(&self, profile: Value) {
        if self.max_buffered == 0 {
            return;
        }
        let mut queue = self.queue.lock();
        queue.push_back(profile);
        Self::truncate(&mut queue, self.max_buffered);
    }
}

/// Appends every profile as one JSON document per line.
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(JsonLinesSink {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl ProfileSink for JsonLinesSink {
    fn send(&self, profiles: &[Value]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock();
        for profile in profiles {
            serde_json::to_writer(&mut *writer, profile).context("couldn't write profile")?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}
