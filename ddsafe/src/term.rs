#[cfg(unix)]
use libc::ECHOCTL;
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Disables `ECHOCTL` on the controlling terminal while alive.
///
/// With `ECHOCTL` set, Ctrl+C shows up as `^C` in the middle of a progress
/// bar. The Ctrl+C handler reports cancellation itself, so the echo is only
/// noise. The original settings are restored on drop.
pub struct TermRestorer {
    #[cfg(unix)]
    original: Option<Termios>,
}

impl TermRestorer {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self { original: None };
            }
            let fd = stdout().as_raw_fd();
            let original = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(original) = &self.original {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original).ok();
        }
    }
}
