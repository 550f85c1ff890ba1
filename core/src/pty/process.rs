//! PTY process wrapper: spawn a CLI under a PTY and bridge its I/O to the async
//! side. A blocking thread drains the master and forwards chunks over a channel;
//! the pause flag stops that draining so the CLI eventually blocks on write,
//! which is the substrate the backpressure controller relies on. Resize runs on
//! its own thread, and a poller watches for exit.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{self, Arc, Mutex};

use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

/// How often the reader thread re-checks the pause flag while paused.
const PAUSE_POLL_MS: u64 = 10;
/// How often the exit watcher polls the child.
const EXIT_POLL_MS: u64 = 200;

/// Buffer that handles UTF-8 sequences split across PTY read boundaries.
/// Incomplete trailing bytes are carried into the next read so every chunk
/// handed to the pipeline is valid UTF-8.
pub(crate) struct Utf8Carry {
    remainder: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn new() -> Self {
        Self {
            remainder: Vec::with_capacity(4),
        }
    }

    /// Process raw bytes from one read, returning the valid-UTF-8 prefix.
    pub(crate) fn push(&mut self, new_bytes: &[u8]) -> String {
        let mut combined = Vec::with_capacity(self.remainder.len() + new_bytes.len());
        combined.extend_from_slice(&self.remainder);
        combined.extend_from_slice(new_bytes);
        self.remainder.clear();

        let valid_up_to = match std::str::from_utf8(&combined) {
            Ok(_) => combined.len(),
            Err(e) => {
                let valid = e.valid_up_to();
                match e.error_len() {
                    // Incomplete sequence at the end: carry it into the next read.
                    None => valid,
                    // Invalid bytes mid-stream: replace them and keep going.
                    Some(error_len) => {
                        let mut result =
                            String::from_utf8_lossy(&combined[..valid + error_len]).into_owned();
                        if valid + error_len < combined.len() {
                            result.push_str(&self.push(&combined[valid + error_len..]));
                        }
                        return result;
                    }
                }
            }
        };

        if valid_up_to < combined.len() {
            self.remainder.extend_from_slice(&combined[valid_up_to..]);
        }
        combined.truncate(valid_up_to);
        // Verified valid above.
        unsafe { String::from_utf8_unchecked(combined) }
    }

    /// Flush whatever is left at EOF. An incomplete sequence becomes U+FFFD.
    pub(crate) fn flush(&mut self) -> String {
        if self.remainder.is_empty() {
            return String::new();
        }
        let remaining = std::mem::take(&mut self.remainder);
        String::from_utf8_lossy(&remaining).into_owned()
    }
}

/// Sender to request PTY resize (cols, rows). A dedicated thread runs master.resize().
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Live PTY child: writer for stdin, resize sender, pause flag shared with the
/// reader thread, and the child handle for kill/wait.
pub struct PtyProcess {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    resize_tx: ResizeSender,
    paused: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Spawn `cmd` under a fresh PTY of the given size. Returns the process
    /// handle, a receiver of output chunks, and a receiver that yields the exit
    /// code once.
    pub fn spawn(
        cmd: CommandBuilder,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<(Self, mpsc::Receiver<Bytes>, mpsc::Receiver<u32>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("openpty: {e}"))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow::anyhow!("spawn: {e}"))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow::anyhow!("clone reader: {e}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow::anyhow!("take writer: {e}"))?;
        let master = pair.master;

        let (out_tx, out_rx) = mpsc::channel::<Bytes>(256);
        let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
        let (exit_tx, exit_rx) = mpsc::channel::<u32>(1);

        let child = Arc::new(Mutex::new(child));
        let paused = Arc::new(AtomicBool::new(false));

        // Blocking reader: drain the PTY master and forward chunks. While the
        // pause flag is set the loop stops reading entirely.
        let paused_reader = paused.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let mut carry = Utf8Carry::new();
            loop {
                while paused_reader.load(Ordering::Relaxed) {
                    std::thread::sleep(std::time::Duration::from_millis(PAUSE_POLL_MS));
                }
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = carry.push(&buf[..n]);
                        if !text.is_empty()
                            && out_tx.blocking_send(Bytes::from(text)).is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let tail = carry.flush();
            if !tail.is_empty() {
                let _ = out_tx.blocking_send(Bytes::from(tail));
            }
        });

        // Dedicated resize thread (master.resize is blocking).
        std::thread::spawn(move || {
            while let Ok((cols, rows)) = resize_rx.recv() {
                let size = PtySize {
                    cols,
                    rows,
                    pixel_width: 0,
                    pixel_height: 0,
                };
                let _ = master.resize(size);
            }
        });

        // Exit watcher: poll try_wait, send the exit code once.
        let child_poll = Arc::clone(&child);
        std::thread::spawn(move || loop {
            let status = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match guard.try_wait() {
                    Ok(None) => None,
                    Ok(Some(s)) => Some(s.exit_code()),
                    Err(_) => break,
                }
            };
            if let Some(code) = status {
                let _ = exit_tx.blocking_send(code);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(EXIT_POLL_MS));
        });

        let process = PtyProcess {
            writer: Arc::new(Mutex::new(writer)),
            child,
            resize_tx,
            paused,
        };
        Ok((process, out_rx, exit_rx))
    }

    /// Write raw bytes to the CLI's stdin. Blocking; call from a blocking context.
    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("writer mutex poisoned"))?;
        guard.write_all(data)?;
        guard.flush()
    }

    /// Request a resize of the PTY.
    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.resize_tx.send((cols, rows));
    }

    /// Stop draining the PTY master. The CLI keeps writing into the kernel
    /// buffer until it fills, then blocks.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resume draining.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Kill the PTY child process.
    pub fn kill(&self) -> std::io::Result<()> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| std::io::Error::other("child mutex poisoned"))?;
        guard.kill()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_carry_passes_ascii_through() {
        let mut c = Utf8Carry::new();
        assert_eq!(c.push(b"hello world"), "hello world");
        assert_eq!(c.flush(), "");
    }

    #[test]
    fn utf8_carry_joins_split_multibyte() {
        let mut c = Utf8Carry::new();
        let euro = "€".as_bytes();
        assert_eq!(c.push(&euro[..1]), "");
        assert_eq!(c.push(&euro[1..]), "€");
    }

    #[test]
    fn utf8_carry_joins_split_emoji() {
        let mut c = Utf8Carry::new();
        let crab = "🦀".as_bytes();
        assert_eq!(crab.len(), 4);
        assert_eq!(c.push(&crab[..2]), "");
        assert_eq!(c.push(&crab[2..]), "🦀");
    }

    #[test]
    fn utf8_carry_replaces_invalid_bytes() {
        let mut c = Utf8Carry::new();
        let out = c.push(&[b'a', 0xFF, b'b']);
        assert!(out.starts_with('a'));
        assert!(out.ends_with('b'));
        assert!(out.contains('\u{FFFD}'));
    }

    #[test]
    fn utf8_carry_flush_replaces_incomplete_tail() {
        let mut c = Utf8Carry::new();
        assert_eq!(c.push(&"€".as_bytes()[..2]), "");
        assert_eq!(c.flush(), "\u{FFFD}");
    }
}
