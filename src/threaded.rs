//! The threaded writer.
//!
//! One worker thread per open file drains the command ring and dispatches to
//! the [`Writer`](crate::write::Writer) façade, so producers submitting bulk
//! samples never wait on disk I/O. Commands are applied in FIFO order. The
//! worker captures its first error; subsequent sample data is discarded and
//! producer calls surface the stored error on their next interaction.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::records::{AnnotationType, SignalDef, SourceDef, StorageType};
use crate::ring::{ring, Consumer, Producer};
use crate::write::{WriteOptions, Writer};
use crate::{ErrorCode, SiglogError, SiglogResult, WriterFlag, WriterFlags};

/// Completion gate for [`ThreadedWriter::flush`].
struct FlushGate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl FlushGate {
    fn new() -> Arc<FlushGate> {
        Arc::new(FlushGate {
            done: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn signal(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}

enum Command {
    SourceDef(SourceDef),
    SignalDef(SignalDef),
    Fsr {
        signal_id: u16,
        sample_id: i64,
        data: Vec<u8>,
        samples: usize,
    },
    Annotation {
        signal_id: u16,
        timestamp: i64,
        y: f32,
        annotation_type: AnnotationType,
        group_id: u8,
        storage_type: StorageType,
        payload: Vec<u8>,
    },
    Utc {
        signal_id: u16,
        sample_id: i64,
        timestamp: i64,
    },
    UserData {
        user_meta: u16,
        storage_type: StorageType,
        payload: Vec<u8>,
    },
    FsrOmitData {
        signal_id: u16,
        omit: bool,
    },
    SetFlags(u32),
    Flush(Arc<FlushGate>),
    Close,
}

impl Command {
    /// Only bulk sample data may be dropped under `DROP_ON_OVERFLOW`.
    fn droppable(&self) -> bool {
        matches!(self, Command::Fsr { .. })
    }
}

struct Shared {
    flags: AtomicU32,
    dropped: AtomicU64,
    error: Mutex<Option<(ErrorCode, String)>>,
}

impl Shared {
    fn record_error(&self, err: &SiglogError) {
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some((err.code(), err.to_string()));
        }
    }

    fn first_error(&self) -> Option<SiglogError> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(code, msg)| SiglogError::from_code(*code, msg.clone()))
    }
}

/// Producer-side handle for a file written on a background thread.
///
/// Mirrors the [`Writer`] surface; every call enqueues a command. `flush`
/// blocks until the worker has applied everything submitted so far;
/// [`close`](Self::close) drains, flushes, joins the worker and returns the
/// first captured error.
pub struct ThreadedWriter {
    producer: Producer<Command>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedWriter {
    /// Create the file and start its writer thread.
    pub fn create<P: AsRef<Path>>(path: P, options: WriteOptions) -> SiglogResult<ThreadedWriter> {
        let file = File::create(path)?;
        let writer = Writer::with_options(file, options.clone())?;
        let shared = Arc::new(Shared {
            flags: AtomicU32::new(options.flags.as_u32()),
            dropped: AtomicU64::new(0),
            error: Mutex::new(None),
        });
        let (producer, consumer) = ring(options.ring_capacity);
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("siglog-writer".into())
            .spawn(move || run_worker(consumer, worker_shared, writer))?;
        Ok(ThreadedWriter {
            producer,
            shared,
            worker: Some(worker),
        })
    }

    pub fn flags(&self) -> WriterFlags {
        WriterFlags::from_u32_truncated(self.shared.flags.load(Ordering::Acquire))
    }

    /// Flags propagate atomically; the drop policy applies to submissions
    /// made after this call returns.
    pub fn set_flags(&mut self, flags: WriterFlags) -> SiglogResult<()> {
        self.shared.flags.store(flags.as_u32(), Ordering::Release);
        self.submit(Command::SetFlags(flags.as_u32()))
    }

    /// Sample commands dropped so far under `DROP_ON_OVERFLOW`.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn check_error(&self) -> SiglogResult<()> {
        match self.shared.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn submit(&mut self, command: Command) -> SiglogResult<()> {
        self.check_error()?;
        if command.droppable() && self.flags().contains(WriterFlag::DropOnOverflow) {
            if self.producer.try_push(command).is_err() {
                if self.producer.is_closed() {
                    return Err(SiglogError::Abort("writer thread is gone".into()));
                }
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("command ring full: dropped one sample command");
            }
            Ok(())
        } else {
            self.producer
                .push(command)
                .map_err(|_| SiglogError::Abort("writer thread is gone".into()))
        }
    }

    pub fn source_def(&mut self, def: &SourceDef) -> SiglogResult<()> {
        self.submit(Command::SourceDef(def.clone()))
    }

    pub fn signal_def(&mut self, def: &SignalDef) -> SiglogResult<()> {
        self.submit(Command::SignalDef(def.clone()))
    }

    pub fn fsr(
        &mut self,
        signal_id: u16,
        sample_id: i64,
        data: &[u8],
        samples: usize,
    ) -> SiglogResult<()> {
        self.submit(Command::Fsr {
            signal_id,
            sample_id,
            data: data.to_vec(),
            samples,
        })
    }

    pub fn fsr_f32(&mut self, signal_id: u16, sample_id: i64, samples: &[f32]) -> SiglogResult<()> {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.submit(Command::Fsr {
            signal_id,
            sample_id,
            data,
            samples: samples.len(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn annotation(
        &mut self,
        signal_id: u16,
        timestamp: i64,
        y: f32,
        annotation_type: AnnotationType,
        group_id: u8,
        storage_type: StorageType,
        payload: &[u8],
    ) -> SiglogResult<()> {
        self.submit(Command::Annotation {
            signal_id,
            timestamp,
            y,
            annotation_type,
            group_id,
            storage_type,
            payload: payload.to_vec(),
        })
    }

    pub fn utc(&mut self, signal_id: u16, sample_id: i64, timestamp: i64) -> SiglogResult<()> {
        self.submit(Command::Utc {
            signal_id,
            sample_id,
            timestamp,
        })
    }

    pub fn user_data(
        &mut self,
        user_meta: u16,
        storage_type: StorageType,
        payload: &[u8],
    ) -> SiglogResult<()> {
        self.submit(Command::UserData {
            user_meta,
            storage_type,
            payload: payload.to_vec(),
        })
    }

    pub fn fsr_omit_data(&mut self, signal_id: u16, omit: bool) -> SiglogResult<()> {
        self.submit(Command::FsrOmitData { signal_id, omit })
    }

    /// Block until the worker has applied everything submitted so far and
    /// flushed the file.
    pub fn flush(&mut self) -> SiglogResult<()> {
        let gate = FlushGate::new();
        self.submit(Command::Flush(gate.clone()))?;
        gate.wait();
        self.check_error()
    }

    /// Drain the ring, flush every track, join the worker. The first
    /// captured error wins.
    pub fn close(mut self) -> SiglogResult<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> SiglogResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let push_result = self.producer.push(Command::Close);
        if worker.join().is_err() {
            return Err(SiglogError::Abort("writer thread panicked".into()));
        }
        if let Some(err) = self.shared.first_error() {
            return Err(err);
        }
        push_result.map_err(|_| SiglogError::Abort("writer thread is gone".into()))
    }
}

impl Drop for ThreadedWriter {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

fn run_worker(mut consumer: Consumer<Command>, shared: Arc<Shared>, mut writer: Writer<File>) {
    consumer.register();
    loop {
        match consumer.pop() {
            Some(Command::Close) => {
                if let Err(err) = writer.finish() {
                    shared.record_error(&err);
                }
                return;
            }
            Some(command) => apply(&mut writer, &shared, command),
            None => {
                if consumer.is_closed() {
                    // producer handle dropped without close; finish anyway
                    if let Err(err) = writer.finish() {
                        shared.record_error(&err);
                    }
                    return;
                }
                consumer.wait(Duration::from_millis(1));
            }
        }
    }
}

fn apply(writer: &mut Writer<File>, shared: &Shared, command: Command) {
    // After the first error, sample data is discarded; control commands
    // still apply so flush and close stay well-defined.
    let errored = shared.first_error().is_some();
    let result = match command {
        Command::SourceDef(def) => writer.source_def(&def),
        Command::SignalDef(def) => writer.signal_def(&def),
        Command::Fsr {
            signal_id,
            sample_id,
            data,
            samples,
        } => {
            if errored {
                return;
            }
            writer.fsr(signal_id, sample_id, &data, samples)
        }
        Command::Annotation {
            signal_id,
            timestamp,
            y,
            annotation_type,
            group_id,
            storage_type,
            payload,
        } => {
            if errored {
                return;
            }
            writer.annotation(
                signal_id,
                timestamp,
                y,
                annotation_type,
                group_id,
                storage_type,
                &payload,
            )
        }
        Command::Utc {
            signal_id,
            sample_id,
            timestamp,
        } => {
            if errored {
                return;
            }
            writer.utc(signal_id, sample_id, timestamp)
        }
        Command::UserData {
            user_meta,
            storage_type,
            payload,
        } => writer.user_data(user_meta, storage_type, &payload),
        Command::FsrOmitData { signal_id, omit } => writer.fsr_omit_data(signal_id, omit),
        Command::SetFlags(bits) => {
            writer.set_flags(WriterFlags::from_u32_truncated(bits));
            Ok(())
        }
        Command::Flush(gate) => {
            let result = writer.flush();
            gate.signal();
            result
        }
        Command::Close => unreachable!("close is handled by the worker loop"),
    };
    if let Err(err) = result {
        log::warn!("writer command failed: {err}");
        shared.record_error(&err);
    }
}
