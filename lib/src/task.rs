use std::ffi::OsStr;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

/// Wrapper for running the external helper binaries (busybox, lz4, the
/// FUSE filesystem helpers, kexec, the decryption helper).  Everything
/// this process spawns goes through here so that the invocation and its
/// outcome end up in the kernel log.
pub(crate) struct Task {
    description: String,
    quiet: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<OsStr>) -> Self {
        let description = description.as_ref().to_string();
        let mut cmd = Command::new(exe.as_ref());
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    pub(crate) fn env(mut self, key: &str, val: &str) -> Self {
        self.cmd.env(key, val);
        self
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            tracing::info!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        let st = cmd
            .status()
            .with_context(|| format!("Spawning {description} failed"))?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }

    /// Like [`Self::run`], but return stdout.
    pub(crate) fn read(self) -> Result<String> {
        let description = self.description.clone();
        let (out, st) = self.read_with_status()?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(out)
    }

    /// Return stdout and the exit status, without treating a nonzero exit
    /// as an error.  The decryption helper communicates through both.
    pub(crate) fn read_with_status(self) -> Result<(String, ExitStatus)> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            tracing::info!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        cmd.stdout(Stdio::piped());
        let child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let o = child
            .wait_with_output()
            .with_context(|| format!("Executing {description} failed"))?;
        let out = String::from_utf8_lossy(&o.stdout).into_owned();
        Ok((out, o.status))
    }

    pub(crate) fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<OsStr>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let mut t = Self::new(description.as_ref(), exe);
        t.cmd.args(args);
        t.run()
    }
}
