//! Supervisor for the debug adbd daemon: fork it, wait, restart it after
//! a short delay for as long as the run flag is set.

use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::paths::Paths;

const RESTART_DELAY: Duration = Duration::from_millis(300);

pub(crate) struct AdbSupervisor {
    run: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    handle: Option<JoinHandle<()>>,
}

impl AdbSupervisor {
    pub(crate) fn start(paths: &Paths) -> Self {
        let adbd = paths.helper("adbd");
        let run = Arc::new(AtomicBool::new(true));
        let child: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));
        let handle = {
            let run = run.clone();
            let child_slot = child.clone();
            std::thread::spawn(move || {
                while run.load(Ordering::Relaxed) {
                    let spawned = Command::new(&adbd)
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .spawn();
                    match spawned {
                        Ok(c) => {
                            *child_slot.lock().unwrap() = Some(c);
                            // Wait on our own handle; stop() kills it.
                            loop {
                                let done = child_slot
                                    .lock()
                                    .unwrap()
                                    .as_mut()
                                    .map(|c| c.try_wait())
                                    .transpose()
                                    .ok()
                                    .flatten()
                                    .map(|st| st.is_some())
                                    .unwrap_or(true);
                                if done || !run.load(Ordering::Relaxed) {
                                    break;
                                }
                                std::thread::sleep(Duration::from_millis(50));
                            }
                            *child_slot.lock().unwrap() = None;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to start adbd: {e}");
                        }
                    }
                    if !run.load(Ordering::Relaxed) {
                        break;
                    }
                    std::thread::sleep(RESTART_DELAY);
                }
            })
        };
        tracing::info!("ADB supervisor started");
        Self {
            run,
            child,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(&mut self) {
        self.run.store(false, Ordering::Relaxed);
        if let Some(child) = self.child.lock().unwrap().as_mut() {
            let _ = child.kill();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        tracing::info!("ADB supervisor stopped");
    }
}

impl Drop for AdbSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
