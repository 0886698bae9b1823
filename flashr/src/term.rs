#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Keeps Ctrl+C from echoing as `^C` while a flash is running, so the
/// cancellation message prints cleanly. Restores the terminal on drop.
pub struct EchoGuard {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl EchoGuard {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            Self {
                saved: Self::suppress_echoctl(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    #[cfg(unix)]
    fn suppress_echoctl() -> Option<Termios> {
        let out = stdout();
        if !out.is_terminal() {
            return None;
        }
        let fd = out.as_raw_fd();
        let saved = Termios::from_fd(fd).ok()?;
        let mut quiet = saved;
        quiet.c_lflag &= !ECHOCTL;
        tcsetattr(fd, TCSANOW, &quiet).ok()?;
        Some(saved)
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = &self.saved {
            let _ = tcsetattr(stdout().as_raw_fd(), TCSANOW, saved);
        }
    }
}
