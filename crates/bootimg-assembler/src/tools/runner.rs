use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;

use crate::error::{Error, Result};

use super::Tool;
use super::sanitize::sanitize_tool_line;

/// A pending invocation of one external tool.
///
/// Output that is not redirected to a file is streamed line by line into
/// `tracing` at debug level, tagged with the tool name. The call blocks until
/// the child exits; there is no timeout.
#[derive(Debug)]
pub struct ToolCommand {
    tool: Tool,
    cmd: Command,
    stdin: Option<File>,
    stdout_path: Option<PathBuf>,
}

impl ToolCommand {
    pub(super) fn new(tool: Tool, program: PathBuf) -> Self {
        Self {
            tool,
            cmd: Command::new(program),
            stdin: None,
            stdout_path: None,
        }
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn current_dir(&mut self, dir: &Path) -> &mut Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Feed the child from an open file. The handle's offset is shared with
    /// any clone of it, so successive children continue where the last stopped.
    pub fn stdin_file(&mut self, file: File) -> &mut Self {
        self.stdin = Some(file);
        self
    }

    /// Truncate `path` and send the child's stdout into it.
    pub fn stdout_to(&mut self, path: &Path) -> &mut Self {
        self.stdout_path = Some(path.to_path_buf());
        self
    }

    /// Run to completion and require a zero exit status.
    pub fn run(&mut self) -> Result<()> {
        let status = self.status()?;
        if !status.success() {
            return Err(Error::tool_failed(self.tool.name(), status));
        }
        Ok(())
    }

    /// Run to completion and hand back whatever status the child exited with.
    pub fn status(&mut self) -> Result<ExitStatus> {
        let name = self.tool.name();
        tracing::debug!(tool = name, cmd = ?self.cmd, "running tool");

        let stdout_redirect = match &self.stdout_path {
            Some(p) => Some(File::create(p).map_err(|e| Error::io("create", p, e))?),
            None => None,
        };
        let stdin = match self.stdin.take() {
            Some(f) => Stdio::from(f),
            None => Stdio::null(),
        };
        let stdout = match stdout_redirect {
            Some(f) => Stdio::from(f),
            None => Stdio::piped(),
        };

        let mut child = self
            .cmd
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::tool_launch(name, e))?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(out, tx)));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(err, tx)));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_tool_line(&line);
            if !line.is_empty() {
                tracing::debug!(tool = name, "{line}");
            }
        }
        for r in readers {
            let _ = r.join();
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("waiting for `{name}` failed: {e}")))?;
        tracing::debug!(tool = name, %status, "tool exited");
        Ok(status)
    }
}

// Forward each `\n`/`\r`-separated line; overlong lines arrive in pieces.
fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_CHUNK: u64 = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut chunk = Vec::new();
    loop {
        chunk.clear();
        match r.by_ref().take(MAX_CHUNK).read_until(b'\n', &mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        for line in chunk
            .split(|b| *b == b'\n' || *b == b'\r')
            .filter(|l| !l.is_empty())
        {
            if tx.send(String::from_utf8_lossy(line).into_owned()).is_err() {
                return;
            }
        }
    }
}
