//! The long-lived cooperating threads: a ~16 ms ticker driving periodic
//! callbacks (auto-boot countdown) and the USB refresh poller watching
//! `/dev/block` for hotplug.
//!
//! Shutdown is always the same two steps: clear the atomic run flag,
//! join the thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;

use crate::partitions::{block_dir_ctime, PartitionSet};
use crate::paths::Paths;

const TICK: Duration = Duration::from_millis(16);
const USB_POLL: Duration = Duration::from_millis(50);

type WorkerCall = Box<dyn FnMut(u64) + Send>;

#[derive(Default)]
struct WorkerState {
    calls: Vec<(usize, WorkerCall)>,
}

/// The ticker thread.  Callbacks run under the shared lock and receive
/// the milliseconds elapsed since the previous tick.
pub(crate) struct Workers {
    run: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    next_token: AtomicUsize,
    handle: Option<JoinHandle<()>>,
}

impl Workers {
    pub(crate) fn start() -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let state = Arc::new(Mutex::new(WorkerState::default()));
        let handle = {
            let run = run.clone();
            let state = state.clone();
            std::thread::spawn(move || {
                let mut last = Instant::now();
                while run.load(Ordering::Relaxed) {
                    std::thread::sleep(TICK);
                    let elapsed = last.elapsed().as_millis() as u64;
                    last = Instant::now();
                    let mut state = state.lock().unwrap();
                    for (_, call) in state.calls.iter_mut() {
                        call(elapsed);
                    }
                }
            })
        };
        Self {
            run,
            state,
            next_token: AtomicUsize::new(0),
            handle: Some(handle),
        }
    }

    /// Register a callback; the returned token removes it again.
    pub(crate) fn add(&self, call: WorkerCall) -> usize {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().calls.push((token, call));
        token
    }

    pub(crate) fn remove(&self, token: usize) {
        self.state.lock().unwrap().calls.retain(|(t, _)| *t != token);
    }

    pub(crate) fn stop(&mut self) {
        self.run.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The USB refresh thread: poll the ctime of `/dev/block`, rebuild the
/// partition set under its lock when it changes, and fire the callback
/// so the selection list can redraw.
pub(crate) struct UsbRefresh {
    run: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UsbRefresh {
    pub(crate) fn start(
        paths: Arc<Paths>,
        parts: Arc<Mutex<PartitionSet>>,
        on_change: Box<dyn Fn() + Send>,
    ) -> Self {
        Self::start_watching(Utf8PathBuf::from("/dev/block"), paths, parts, on_change)
    }

    fn start_watching(
        watch: Utf8PathBuf,
        paths: Arc<Paths>,
        parts: Arc<Mutex<PartitionSet>>,
        on_change: Box<dyn Fn() + Send>,
    ) -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let handle = {
            let run = run.clone();
            std::thread::spawn(move || {
                let mut last_change: Option<i64> = None;
                while run.load(Ordering::Relaxed) {
                    if let Some(ctime) = block_dir_ctime(&watch) {
                        if last_change != Some(ctime) {
                            let mut parts = parts.lock().unwrap();
                            if let Err(e) = parts.refresh(&paths) {
                                tracing::warn!("USB refresh failed: {e:#}");
                            }
                            drop(parts);
                            on_change();
                            last_change = Some(ctime);
                        }
                    }
                    std::thread::sleep(USB_POLL);
                }
            })
        };
        Self {
            run,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(&mut self) {
        self.run.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UsbRefresh {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Block the calling thread until `seconds` have been counted down by the
/// worker ticker, or until `cancel` flips.  Returns true when the
/// countdown ran to zero.
pub(crate) fn countdown(workers: &Workers, seconds: u32, cancel: &Arc<AtomicBool>) -> bool {
    let remaining_ms = Arc::new(AtomicUsize::new(seconds as usize * 1000));
    let done = Arc::new(AtomicBool::new(seconds == 0));
    let token = {
        let remaining_ms = remaining_ms.clone();
        let done = done.clone();
        workers.add(Box::new(move |elapsed| {
            let prev = remaining_ms.load(Ordering::Relaxed);
            let next = prev.saturating_sub(elapsed as usize);
            remaining_ms.store(next, Ordering::Relaxed);
            if next == 0 {
                done.store(true, Ordering::Relaxed);
            }
        }))
    };
    while !done.load(Ordering::Relaxed) && !cancel.load(Ordering::Relaxed) {
        std::thread::sleep(TICK);
    }
    workers.remove(token);
    done.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_add_remove() {
        let mut workers = Workers::start();
        let count = Arc::new(AtomicUsize::new(0));
        let token = {
            let count = count.clone();
            workers.add(Box::new(move |_| {
                count.fetch_add(1, Ordering::Relaxed);
            }))
        };
        std::thread::sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::Relaxed) > 0);

        workers.remove(token);
        let at_remove = count.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::Relaxed), at_remove);
        workers.stop();
    }

    #[test]
    fn test_countdown_completes() {
        let workers = Workers::start();
        let cancel = Arc::new(AtomicBool::new(false));
        let start = Instant::now();
        assert!(countdown(&workers, 0, &cancel));
        assert!(countdown(&workers, 1, &cancel));
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_countdown_cancel() {
        let workers = Workers::start();
        let cancel = Arc::new(AtomicBool::new(true));
        assert!(!countdown(&workers, 3600, &cancel));
    }
}
