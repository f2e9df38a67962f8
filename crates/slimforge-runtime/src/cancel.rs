//! Cooperative cancellation sources polled by long-running operations.

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use crossterm::tty::IsTty;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub trait CancellationToken: Send + Sync {
    fn is_cancelled(&self) -> bool;

    /// Re-arm the token before the next operation. Latching tokens that
    /// represent a one-shot "skip this step" request override this.
    fn reset(&self) {}
}

/// Programmatic cancellation flag, cheap to clone and share across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl CancellationToken for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancellationToken for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Cancelled when any of its members is.
#[derive(Clone, Default)]
pub struct AnyCancel(Vec<Arc<dyn CancellationToken>>);

impl AnyCancel {
    pub fn new(tokens: Vec<Arc<dyn CancellationToken>>) -> Self {
        Self(tokens)
    }
}

impl CancellationToken for AnyCancel {
    fn is_cancelled(&self) -> bool {
        self.0.iter().any(|t| t.is_cancelled())
    }

    fn reset(&self) {
        for t in &self.0 {
            t.reset();
        }
    }
}

/// Single reserved keystroke on the controlling terminal.
///
/// Raw mode is held only for the duration of each poll so log output is not
/// disturbed. When stdin is not a terminal the token never fires.
pub struct KeystrokeCancel {
    key: char,
    fired: AtomicBool,
    interactive: bool,
}

impl KeystrokeCancel {
    pub fn new(key: char) -> Self {
        Self {
            key: key.to_ascii_lowercase(),
            fired: AtomicBool::new(false),
            interactive: std::io::stdin().is_tty(),
        }
    }

    pub fn key(&self) -> char {
        self.key
    }

    fn poll_terminal(&self) -> bool {
        if terminal::enable_raw_mode().is_err() {
            return false;
        }
        let mut hit = false;
        while let Ok(true) = event::poll(Duration::ZERO) {
            match event::read() {
                Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                    if let KeyCode::Char(c) = key.code {
                        if c.to_ascii_lowercase() == self.key {
                            hit = true;
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = terminal::disable_raw_mode();
        hit
    }
}

impl CancellationToken for KeystrokeCancel {
    fn is_cancelled(&self) -> bool {
        if self.fired.load(Ordering::SeqCst) {
            return true;
        }
        if self.interactive && self.poll_terminal() {
            self.fired.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn reset(&self) {
        self.fired.store(false, Ordering::SeqCst);
    }
}
