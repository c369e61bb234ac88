//! Helpers related to tracing, used by main entrypoints
//!
//! This process runs as (or right next to) PID 1, long before any syslog
//! or journal exists, so the only durable log sink is the kernel ring
//! buffer via `/dev/kmsg`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;

/// Each record written to /dev/kmsg must be a single write; longer lines
/// are silently truncated by the kernel, so clamp them ourselves.
const KMSG_RECORD_MAX: usize = 900;

/// kmsg priority prefix: KERN_INFO on the kern facility.
const KMSG_PRIO: &str = "<6>";

struct KmsgWriter {
    dev: Arc<File>,
    tag: Arc<str>,
    buf: Vec<u8>,
}

impl Write for KmsgWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for KmsgWriter {
    fn drop(&mut self) {
        for line in self.buf.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let line = &line[..line.len().min(KMSG_RECORD_MAX)];
            let mut record = Vec::with_capacity(line.len() + self.tag.len() + 8);
            record.extend_from_slice(KMSG_PRIO.as_bytes());
            record.extend_from_slice(self.tag.as_bytes());
            record.extend_from_slice(b": ");
            record.extend_from_slice(line);
            record.push(b'\n');
            // Nothing sensible to do if the kernel log is gone.
            let _ = (&*self.dev).write_all(&record);
        }
    }
}

#[derive(Clone)]
struct KmsgMakeWriter {
    dev: Arc<File>,
    tag: Arc<str>,
}

impl<'a> MakeWriter<'a> for KmsgMakeWriter {
    type Writer = KmsgWriter;

    fn make_writer(&'a self) -> Self::Writer {
        KmsgWriter {
            dev: self.dev.clone(),
            tag: self.tag.clone(),
            buf: Vec::new(),
        }
    }
}

/// Initialize tracing with the default configuration, logging to the
/// kernel ring buffer with the given tag.  Falls back to stderr when
/// `/dev/kmsg` cannot be opened (tests, `-v` invocations on a host).
pub fn initialize_tracing(tag: &str) {
    // Don't include timestamps and such because they're not really useful
    // and too verbose; the kernel log already stamps every record.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(format)
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO);
    match OpenOptions::new().write(true).open("/dev/kmsg") {
        Ok(dev) => {
            let writer = KmsgMakeWriter {
                dev: Arc::new(dev),
                tag: Arc::from(tag),
            };
            builder.with_writer(writer).init();
        }
        Err(_) => {
            builder.with_writer(std::io::stderr).init();
        }
    }
}
