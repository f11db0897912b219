use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

const TAIL_BYTES: usize = 64 * 1024;

/// A subprocess exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("{program} failed ({status}):\n{output_tail}")]
pub struct CommandFailed {
    pub program: String,
    pub status: String,
    pub output_tail: String,
}

/// Structured invocation: argument vector, explicit working directory and
/// environment. Nothing goes through a shell.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn program_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .unwrap_or(&self.program)
            .to_string_lossy()
            .into_owned()
    }

    pub fn arg_list(&self) -> &[OsString] {
        &self.args
    }

    /// Run to completion, streaming output lines into the log. Returns the
    /// retained tail on success; a non-zero exit yields [`CommandFailed`].
    pub async fn run(&self) -> anyhow::Result<String> {
        let name = self.program_name();
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }

        tracing::debug!(cmd = %name, args = ?self.args, cwd = ?self.cwd, "running command");
        let mut child = cmd.spawn().with_context(|| format!("spawn {name}"))?;

        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(stream_lines(s, name.clone(), "stdout")));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(stream_lines(s, name.clone(), "stderr")));

        let status = child.wait().await.with_context(|| format!("wait {name}"))?;
        let stdout_tail = match stdout_task {
            Some(h) => h.await.with_context(|| format!("join {name} stdout"))?,
            None => Vec::new(),
        };
        let stderr_tail = match stderr_task {
            Some(h) => h.await.with_context(|| format!("join {name} stderr"))?,
            None => Vec::new(),
        };

        let mut output_tail = String::from_utf8_lossy(&stdout_tail).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_tail);
        if !stderr.trim().is_empty() {
            if !output_tail.is_empty() && !output_tail.ends_with('\n') {
                output_tail.push('\n');
            }
            output_tail.push_str(&stderr);
        }

        if !status.success() {
            return Err(CommandFailed {
                program: name,
                status: status.to_string(),
                output_tail,
            }
            .into());
        }
        Ok(output_tail)
    }
}

async fn stream_lines<R: AsyncRead + Unpin>(reader: R, name: String, stream: &'static str) -> Vec<u8> {
    let mut tail = TailBuffer::new(TAIL_BYTES);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                tail.push(&line);
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    tracing::info!(cmd = %name, stream, "{text}");
                }
            }
            Err(e) => {
                tracing::debug!(cmd = %name, stream, error = %e, "output stream closed");
                break;
            }
        }
    }
    tail.to_vec()
}

/// Fixed-capacity ring keeping the last `cap` bytes written.
struct TailBuffer {
    buf: Vec<u8>,
    cap: usize,
    start: usize,
    len: usize,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: vec![0; cap.max(1)],
            cap: cap.max(1),
            start: 0,
            len: 0,
        }
    }

    fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() >= self.cap {
            self.buf.copy_from_slice(&data[data.len() - self.cap..]);
            self.start = 0;
            self.len = self.cap;
            return;
        }

        let total = self.len + data.len();
        if total > self.cap {
            self.start = (self.start + total - self.cap) % self.cap;
            self.len = self.cap;
        } else {
            self.len = total;
        }

        let write_pos = (self.start + self.len - data.len()) % self.cap;
        let first = (self.cap - write_pos).min(data.len());
        self.buf[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    fn to_vec(&self) -> Vec<u8> {
        if self.start + self.len <= self.cap {
            return self.buf[self.start..self.start + self.len].to_vec();
        }
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(&self.buf[self.start..]);
        out.extend_from_slice(&self.buf[..self.len - (self.cap - self.start)]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_bytes() {
        let mut t = TailBuffer::new(5);
        t.push(b"hel");
        assert_eq!(t.to_vec(), b"hel");
        t.push(b"lo!!");
        assert_eq!(t.to_vec(), b"llo!!");
        t.push(b"1234567");
        assert_eq!(t.to_vec(), b"34567");
        t.push(b"ab");
        assert_eq!(t.to_vec(), b"567ab");
    }

    #[test]
    fn program_name_strips_directories() {
        let spec = CommandSpec::new("/usr/bin/git").arg("clone");
        assert_eq!(spec.program_name(), "git");
        assert_eq!(spec.arg_list().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn success_returns_output_tail() {
        let out = CommandSpec::new("sh")
            .args(["-c", "echo one; echo two >&2"])
            .run()
            .await
            .unwrap();
        assert!(out.contains("one"));
        assert!(out.contains("two"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_carries_status_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandSpec::new("sh")
            .args(["-c", "pwd; echo bad >&2; exit 3"])
            .current_dir(dir.path())
            .env("EASEL_TEST", "1")
            .run()
            .await
            .unwrap_err();
        let failed = err.downcast_ref::<CommandFailed>().unwrap();
        assert_eq!(failed.program, "sh");
        assert!(failed.status.contains('3'));
        assert!(failed.output_tail.contains("bad"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = CommandSpec::new("easel-definitely-not-a-program")
            .run()
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<CommandFailed>().is_none());
        assert!(err.to_string().contains("spawn"));
    }
}
