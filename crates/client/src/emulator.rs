//! The terminal emulator seam.
//!
//! An emulator renders shell output onto a screen grid and knows how big that
//! grid is. Parsing escape sequences is entirely its business; the controller
//! only hands it text.

use std::io::{self, Write};

use crossterm::terminal;
use protocol::TerminalSize;

/// A screen that shell output is rendered onto.
pub trait Emulator: Send {
    /// Binds the emulator to its display surface.
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Renders a chunk of output verbatim.
    fn write(&mut self, text: &str) -> io::Result<()>;

    /// Fits the grid to the available space and returns the new size.
    fn fit(&mut self) -> io::Result<TerminalSize>;

    /// The size computed by the last [`Emulator::fit`].
    fn size(&self) -> TerminalSize;

    /// Releases the display surface.
    fn dispose(&mut self) -> io::Result<()>;
}

/// The local terminal, driven through crossterm.
///
/// The terminal is switched to raw mode while the emulator is open so every
/// keystroke, control sequences included, reaches the remote shell.
pub struct CrosstermEmulator<W: Write + Send = io::Stdout> {
    out: W,
    size: TerminalSize,
    raw: bool,
}

impl CrosstermEmulator<io::Stdout> {
    /// Renders to standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> CrosstermEmulator<W> {
    /// Renders to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out,
            size: TerminalSize::default(),
            raw: false,
        }
    }

    /// Whether raw mode is currently enabled by this emulator.
    pub fn is_raw(&self) -> bool {
        self.raw
    }
}

impl<W: Write + Send> Emulator for CrosstermEmulator<W> {
    fn open(&mut self) -> io::Result<()> {
        if !self.raw {
            terminal::enable_raw_mode()?;
            self.raw = true;
        }
        Ok(())
    }

    fn write(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes())?;
        self.out.flush()
    }

    fn fit(&mut self) -> io::Result<TerminalSize> {
        let (cols, rows) = terminal::size()?;
        self.size = TerminalSize::new(cols.max(1), rows.max(1));
        Ok(self.size)
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn dispose(&mut self) -> io::Result<()> {
        self.out.flush()?;
        if self.raw {
            self.raw = false;
            terminal::disable_raw_mode()?;
        }
        Ok(())
    }
}

impl<W: Write + Send> Drop for CrosstermEmulator<W> {
    fn drop(&mut self) {
        if self.raw {
            let _ = terminal::disable_raw_mode();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_is_verbatim() {
        let mut emulator = CrosstermEmulator::new(Vec::new());
        emulator.write("\x1b[1mbold\x1b[0m\r\n").unwrap();
        emulator.write("ünïcödé").unwrap();
        assert_eq!(
            String::from_utf8(emulator.out.clone()).unwrap(),
            "\x1b[1mbold\x1b[0m\r\nünïcödé"
        );
    }

    #[test]
    fn test_dispose_without_open() {
        let mut emulator = CrosstermEmulator::new(Vec::new());
        assert!(!emulator.is_raw());
        emulator.dispose().unwrap();
        emulator.dispose().unwrap();
    }

    #[test]
    fn test_size_before_fit_is_default() {
        let emulator = CrosstermEmulator::new(Vec::new());
        assert_eq!(emulator.size(), TerminalSize::default());
    }
}
