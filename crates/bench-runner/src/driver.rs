//! Launching the benchmark composition and streaming its output.
//!
//! A run is a single-pass sequence of [`RunEvent`]s: every output line as it
//! is produced, then exactly one terminal [`RunEvent::Exited`].

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::warn;

/// Exit status of a finished run. `None` means the process was killed by a
/// signal or could not be waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunExit {
    pub code: Option<i32>,
}

impl RunExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for RunExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}", code),
            None => f.write_str("signal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Output(String),
    Exited(RunExit),
}

pub struct CompositionRun {
    events: Box<dyn Iterator<Item = RunEvent>>,
}

impl CompositionRun {
    /// Spawns `program` with stderr folded into stdout.
    pub fn spawn<I, S>(program: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec \"$@\" 2>&1").arg("sh").arg(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to launch {}", program))?;
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("no stdout pipe for {}", program))?;
        Ok(Self {
            events: Box::new(ProcessStream {
                child: Some(child),
                reader: Some(BufReader::new(stdout)),
            }),
        })
    }

    /// A run replaying pre-recorded events.
    pub fn from_events(events: Vec<RunEvent>) -> Self {
        Self {
            events: Box::new(events.into_iter()),
        }
    }

    /// Drains the run, handing each line to `on_line`, and returns its exit.
    pub fn stream<F>(self, mut on_line: F) -> RunExit
    where
        F: FnMut(&str),
    {
        for event in self {
            match event {
                RunEvent::Output(line) => on_line(&line),
                RunEvent::Exited(exit) => return exit,
            }
        }
        RunExit { code: None }
    }
}

impl Iterator for CompositionRun {
    type Item = RunEvent;

    fn next(&mut self) -> Option<RunEvent> {
        self.events.next()
    }
}

struct ProcessStream {
    child: Option<Child>,
    reader: Option<BufReader<ChildStdout>>,
}

impl ProcessStream {
    fn read_line(&mut self) -> Option<String> {
        let reader = self.reader.as_mut()?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                Some(String::from_utf8_lossy(&buf).into_owned())
            }
            Err(e) => {
                warn!(error = %e, "failed reading composition output");
                None
            }
        }
    }
}

impl Iterator for ProcessStream {
    type Item = RunEvent;

    fn next(&mut self) -> Option<RunEvent> {
        self.child.as_ref()?;
        if let Some(line) = self.read_line() {
            return Some(RunEvent::Output(line));
        }
        // Close our end first so a still-writing child cannot block on a full pipe.
        self.reader = None;
        let mut child = self.child.take()?;
        let code = match child.wait() {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "failed waiting for composition");
                None
            }
        };
        Some(RunEvent::Exited(RunExit { code }))
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
