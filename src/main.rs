//! Paced I/O conformance tester: runs a program, feeds it reference input one
//! line per quiet interval (as an interactive user would type it), and checks
//! every line of output against a reference transcript while the program runs.

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

const BUF_SIZE: usize = 1 << 16;

// The mismatch window keeps collecting a little past the report cap so the
// report can tell a truncated window apart from one that ended exactly at cap.
const WINDOW_SLACK: usize = 5;

static VERBOSE: AtomicBool = AtomicBool::new(false);

fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

#[derive(Parser, Debug)]
#[command(author, version, about = "paced I/O conformance tester for interactive programs", long_about = None)]
struct Cli {
    /// Reference input, delivered to the program one line at a time
    input_file: PathBuf,
    /// Expected output transcript, matched byte for byte
    expected_file: PathBuf,
    /// Program to run, followed by its arguments (no shell interpretation)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
    /// Print scheduling details during the run
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
    /// Wait timeout in milliseconds once pacing begins
    #[arg(long, default_value_t = 10)]
    delay_ms: u16,
    /// Wait timeout for the first cycle, giving slow starters time to speak
    #[arg(long, default_value_t = 1000)]
    warmup_ms: u16,
    /// Mismatched output lines reported before the run is cut short
    #[arg(long, default_value_t = 10)]
    wrong_lines: usize,
    /// Leftover input/output lines listed before truncation
    #[arg(long, default_value_t = 15)]
    context_lines: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    VERBOSE.store(cli.verbose, Ordering::Relaxed);

    let input = load_script(&cli.input_file)?;
    let expected = load_script(&cli.expected_file)?;

    let mut session = Session::spawn(&cli, input, expected)?;
    let outcome = session.run()?;
    if !outcome.passed() {
        bail!("conformance failures encountered");
    }
    Ok(())
}

fn load_script(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

// --------------------- Run outcome ----------------------------------------
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RunOutcome {
    output_mismatch: bool,
    unexpected_error_output: bool,
    premature_eof: bool,
    unconsumed_input: bool,
    unconsumed_expected: bool,
}

impl RunOutcome {
    fn passed(&self) -> bool {
        *self == Self::default()
    }
}

// --------------------- Child process --------------------------------------
/// Owns the child's process handle; kills and reaps it on every exit path.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn shutdown(&mut self) {
        if self.reaped {
            return;
        }
        // kill fails once the child has already exited; wait still reaps it
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// --------------------- Input feeder ---------------------------------------
/// Next chunk to deliver: up to and including the first newline, or all
/// remaining bytes when no newline is left.
fn next_chunk(remaining: &[u8]) -> &[u8] {
    match remaining.iter().position(|&b| b == b'\n') {
        Some(nl) => &remaining[..=nl],
        None => remaining,
    }
}

// --------------------- Output comparator ----------------------------------
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Match,
    Wrong,
    WindowFull,
}

/// Checks newline-terminated records against the unconsumed head of the
/// expected transcript and collects wrong lines for the final report.
struct Comparator {
    expected: Vec<u8>,
    pos: usize,
    wrong: Vec<Vec<u8>>,
    cap: usize,
}

impl Comparator {
    fn new(expected: Vec<u8>, cap: usize) -> Self {
        Self {
            expected,
            pos: 0,
            wrong: Vec::new(),
            cap,
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.expected[self.pos..]
    }

    fn has_mismatch(&self) -> bool {
        !self.wrong.is_empty()
    }

    /// A record matches only if it is a byte-exact prefix of the remaining
    /// expected output and no earlier mismatch is open; once a line is wrong,
    /// every later line is wrong too (no resynchronization).
    fn consume_line(&mut self, line: &[u8]) -> Verdict {
        if self.wrong.is_empty() && self.remaining().starts_with(line) {
            self.pos += line.len();
            return Verdict::Match;
        }
        self.wrong.push(line.to_vec());
        if self.wrong.len() >= self.cap + WINDOW_SLACK {
            Verdict::WindowFull
        } else {
            Verdict::Wrong
        }
    }

    /// Pulls up to `n` lines off the expected head for side-by-side reporting.
    /// A trailing unterminated fragment counts as the last line.
    fn take_expected_lines(&mut self, n: usize) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for _ in 0..n {
            let rest = &self.expected[self.pos..];
            match rest.iter().position(|&b| b == b'\n') {
                Some(nl) => {
                    lines.push(rest[..=nl].to_vec());
                    self.pos += nl + 1;
                }
                None => {
                    lines.push(rest.to_vec());
                    self.pos = self.expected.len();
                    break;
                }
            }
        }
        lines
    }

    fn print_window_report(&mut self) {
        let mut wrong = std::mem::take(&mut self.wrong);
        if wrong.len() == 1 {
            println!("\n!!INCORRECT OUTPUT!! Your next line of output was:");
        } else {
            if wrong.len() >= self.cap + WINDOW_SLACK {
                wrong.truncate(self.cap);
            }
            println!(
                "\n!!INCORRECT OUTPUT!! Your next {} lines of output were:",
                wrong.len()
            );
        }
        for line in &wrong {
            println!("{}", render_line(line));
        }

        let correct = self.take_expected_lines(wrong.len());
        if correct.len() == 1 {
            println!("\nbut the next line of output expected was:");
        } else {
            println!("\nbut the next {} lines of output expected were:", correct.len());
        }
        for line in &correct {
            println!("{}", render_line(line));
        }
    }
}

// --------------------- Scheduler ------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Warmup,
    Polling,
    Draining,
    Done,
}

struct Session {
    child: ChildGuard,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: ChildStderr,
    stderr_open: bool,
    input: Vec<u8>,
    cursor: usize,
    /// Unwritten byte count of the chunk picked for delivery, if any.
    pending: Option<usize>,
    /// Output bytes read but not yet terminated by a newline.
    partial: Vec<u8>,
    comparator: Comparator,
    phase: Phase,
    stderr_capture: Option<Vec<u8>>,
    premature_tail: Option<Vec<u8>>,
    scratch: Vec<u8>,
    delay_ms: u16,
    warmup_ms: u16,
    context_lines: usize,
}

impl Session {
    fn spawn(cli: &Cli, input: Vec<u8>, expected: Vec<u8>) -> Result<Self> {
        let (program, args) = cli.command.split_first().expect("clap requires a command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {program:?}"))?;
        if verbose() {
            println!("[exec] {program:?} {args:?}");
        }
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        Ok(Self {
            child: ChildGuard {
                child,
                reaped: false,
            },
            stdin: Some(stdin),
            stdout,
            stderr,
            stderr_open: true,
            input,
            cursor: 0,
            pending: None,
            partial: Vec::new(),
            comparator: Comparator::new(expected, cli.wrong_lines),
            phase: Phase::Warmup,
            stderr_capture: None,
            premature_tail: None,
            scratch: vec![0u8; BUF_SIZE],
            delay_ms: cli.delay_ms,
            warmup_ms: cli.warmup_ms,
            context_lines: cli.context_lines,
        })
    }

    fn run(&mut self) -> Result<RunOutcome> {
        while self.phase != Phase::Done {
            let timeout = PollTimeout::from(match self.phase {
                Phase::Warmup => self.warmup_ms,
                _ => self.delay_ms,
            });

            let mut fds = Vec::with_capacity(3);
            fds.push(PollFd::new(self.stdout.as_fd(), PollFlags::POLLIN));
            let err_idx = if self.stderr_open {
                fds.push(PollFd::new(self.stderr.as_fd(), PollFlags::POLLIN));
                Some(fds.len() - 1)
            } else {
                None
            };
            let in_idx = match (&self.stdin, self.pending) {
                (Some(stdin), Some(_)) => {
                    fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLOUT));
                    Some(fds.len() - 1)
                }
                _ => None,
            };

            let ready = match poll(&mut fds, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("polling child descriptors"),
            };

            let read_mask = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            let write_mask = PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR;
            let revents = |i: usize| fds[i].revents().unwrap_or(PollFlags::empty());
            let stdout_ready = revents(0).intersects(read_mask);
            let stderr_ready = err_idx.is_some_and(|i| revents(i).intersects(read_mask));
            let stdin_ready = in_idx.is_some_and(|i| revents(i).intersects(write_mask));
            drop(fds);

            if self.phase == Phase::Warmup {
                self.phase = Phase::Polling;
            }
            if ready == 0 {
                self.on_quiet_tick();
                continue;
            }

            // stderr first: a child that prints a diagnostic and exits at once
            // must be flagged even though stdout reports EOF in the same round
            if stderr_ready {
                self.read_stderr()?;
            }
            if self.phase != Phase::Done && stdout_ready {
                self.read_stdout()?;
            }
            if self.phase != Phase::Done && stdin_ready {
                self.write_pending()?;
            }
        }

        self.child.shutdown();
        Ok(self.report())
    }

    /// The pacing signal: a wait cycle that saw no I/O and has nothing queued.
    fn on_quiet_tick(&mut self) {
        match self.phase {
            Phase::Draining => {
                // a failure was recorded and the child has gone quiet; an
                // undelivered chunk is abandoned and counts as unread input
                self.phase = Phase::Done;
            }
            _ if self.pending.is_some() => {}
            _ => {
                if self.cursor < self.input.len() {
                    let chunk = next_chunk(&self.input[self.cursor..]);
                    if verbose() {
                        println!("[feed] queueing {} bytes", chunk.len());
                    }
                    self.pending = Some(chunk.len());
                } else if let Some(stdin) = self.stdin.take() {
                    if verbose() {
                        println!("[feed] input exhausted, closing stdin");
                    }
                    drop(stdin);
                }
            }
        }
    }

    fn read_stdout(&mut self) -> Result<()> {
        let n = self
            .stdout
            .read(&mut self.scratch)
            .context("reading child stdout")?;
        if n == 0 {
            if verbose() {
                println!("[loop] stdout closed");
            }
            if !self.partial.is_empty() {
                self.premature_tail = Some(std::mem::take(&mut self.partial));
            }
            self.phase = Phase::Done;
            return Ok(());
        }

        let mut data = std::mem::take(&mut self.partial);
        data.extend_from_slice(&self.scratch[..n]);
        let mut rest: &[u8] = &data;
        while !rest.is_empty() {
            let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
                break;
            };
            let (line, tail) = rest.split_at(nl + 1);
            rest = tail;
            match self.comparator.consume_line(line) {
                Verdict::Match => echo_bytes(line)?,
                Verdict::Wrong => self.phase = Phase::Draining,
                Verdict::WindowFull => {
                    self.phase = Phase::Done;
                    return Ok(());
                }
            }
        }
        self.partial = rest.to_vec();
        Ok(())
    }

    fn read_stderr(&mut self) -> Result<()> {
        let n = self
            .stderr
            .read(&mut self.scratch)
            .context("reading child stderr")?;
        if n == 0 {
            self.stderr_open = false;
            return Ok(());
        }
        if verbose() {
            println!("[loop] captured {n} bytes of error output");
        }
        // any diagnostic output fails the run; keep the first read verbatim
        self.stderr_capture = Some(self.scratch[..n].to_vec());
        self.stderr_open = false;
        self.phase = Phase::Draining;
        Ok(())
    }

    fn write_pending(&mut self) -> Result<()> {
        let Some(remaining) = self.pending else {
            return Ok(());
        };
        let stdin = self.stdin.as_mut().expect("stdin registered while open");
        match stdin.write(&self.input[self.cursor..self.cursor + remaining]) {
            Ok(0) => self.phase = Phase::Done,
            Ok(n) => {
                echo_bytes(&self.input[self.cursor..self.cursor + n])?;
                self.cursor += n;
                self.pending = if n == remaining {
                    None
                } else {
                    Some(remaining - n)
                };
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // the child closed its end; nothing more can be delivered
                self.phase = Phase::Done;
            }
            Err(e) => return Err(e).context("writing child stdin"),
        }
        Ok(())
    }

    // --------------------- Reporting --------------------------------------
    fn report(&mut self) -> RunOutcome {
        let mut outcome = RunOutcome::default();

        if let Some(captured) = &self.stderr_capture {
            outcome.unexpected_error_output = true;
            println!("\n!!ERROR OUTPUT!!");
            print!("{}", String::from_utf8_lossy(captured));
        }
        if self.comparator.has_mismatch() {
            outcome.output_mismatch = true;
            self.comparator.print_window_report();
        }
        if let Some(tail) = &self.premature_tail {
            outcome.premature_eof = true;
            println!("\n!!ERROR!! Program output ended without a newline:");
            println!("{}", render_line(tail));
        }

        // leftovers only mean anything when the run otherwise ended cleanly
        if outcome.passed() {
            if self.cursor < self.input.len() {
                outcome.unconsumed_input = true;
                println!("\n!!ERROR!! Program ended without reading all input. Unused input was:");
                print_leftover(&self.input[self.cursor..], "unread input", self.context_lines);
            }
            if !self.comparator.remaining().is_empty() {
                outcome.unconsumed_expected = true;
                println!("\n!!ERROR!! Program ended but more output was expected. Expected output was:");
                print_leftover(self.comparator.remaining(), "expected output", self.context_lines);
            }
        }
        outcome
    }
}

/// Echoes delivered input and confirmed output verbatim, preserving the
/// interleaved transcript an interactive session would show.
fn echo_bytes(bytes: &[u8]) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(bytes)?;
    out.flush()?;
    Ok(())
}

fn render_line(bytes: &[u8]) -> String {
    format!("{:?}", String::from_utf8_lossy(bytes))
}

fn leftover_lines(data: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                lines.push(rest[..=nl].to_vec());
                rest = &rest[nl + 1..];
            }
            None => {
                lines.push(rest.to_vec());
                break;
            }
        }
    }
    lines
}

fn print_leftover(data: &[u8], label: &str, limit: usize) {
    let lines = leftover_lines(data);
    if lines.len() < limit + WINDOW_SLACK {
        for line in &lines {
            println!("{}", render_line(line));
        }
    } else {
        for line in &lines[..limit] {
            println!("{}", render_line(line));
        }
        println!("... (skipped {} additional lines of {label})", lines.len() - limit);
    }
}
