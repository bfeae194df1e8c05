//! Reading lines and passwords from standard input.

use std::{
    io::{self, BufRead, IsTerminal, Write},
    os::fd::{AsFd, BorrowedFd},
};

use log::warn;
use rustix::termios::{tcgetattr, tcsetattr, LocalModes, OptionalActions, Termios};

/// Number of times the user is asked for a password before giving up.
pub const PASSWORD_ATTEMPTS: usize = 3;

/// Terminal echo is off for as long as this is alive.
#[derive(Debug)]
struct EchoGuard<'fd> {
    fd: BorrowedFd<'fd>,
    saved: Termios,
}

impl<'fd> EchoGuard<'fd> {
    fn disable(fd: BorrowedFd<'fd>) -> io::Result<Self> {
        let saved = tcgetattr(fd)?;
        let mut quiet = saved.clone();
        quiet.local_modes.remove(LocalModes::ECHO);
        tcsetattr(fd, OptionalActions::Flush, &quiet)?;
        Ok(Self { fd, saved })
    }
}

impl Drop for EchoGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = tcsetattr(self.fd, OptionalActions::Now, &self.saved) {
            warn!("failed to restore terminal mode: {err}");
        }
    }
}

/// Reads one line as raw bytes, without its line terminator.  Returns `None` at end of input.
pub fn read_raw_line(input: &mut impl BufRead) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    if input.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with(b"\n") {
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
    }
    Ok(Some(line))
}

/// Reads one line of text, without its line terminator.  Returns `None` at end of input.
pub fn read_line(input: &mut impl BufRead) -> io::Result<Option<String>> {
    read_raw_line(input)?
        .map(|line| {
            String::from_utf8(line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
        })
        .transpose()
}

/// Prompts on stderr and reads a password from stdin.
///
/// On a terminal, echo is disabled while the password is typed.  Otherwise the next line of
/// input is taken as is.
pub fn read_password(prompt: &str) -> io::Result<Option<String>> {
    let stdin = io::stdin();
    let mut stderr = io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;

    if !stdin.is_terminal() {
        return read_line(&mut stdin.lock());
    }

    let password = {
        let _echo = EchoGuard::disable(stdin.as_fd())?;
        read_line(&mut stdin.lock())
    };
    writeln!(stderr)?;
    password
}

/// Runs `attempt` with passwords from `read`, at most [`PASSWORD_ATTEMPTS`] times.
///
/// Returns the first success, or the last failure once the attempts are used up, `read` runs
/// out of input, or a failure is one that `wrong_password` says another password can't fix.
/// `last` is the failure to report if no attempt is made at all.
pub fn retry_password<T, E: std::fmt::Display>(
    mut read: impl FnMut() -> io::Result<Option<String>>,
    mut attempt: impl FnMut(&str) -> Result<T, E>,
    wrong_password: impl Fn(&E) -> bool,
    mut last: E,
) -> anyhow::Result<Result<T, E>> {
    for _ in 0..PASSWORD_ATTEMPTS {
        let Some(password) = read()? else {
            break;
        };
        match attempt(&password) {
            Ok(value) => return Ok(Ok(value)),
            Err(err) if !wrong_password(&err) => return Ok(Err(err)),
            Err(err) => {
                eprintln!("cvmfs-letter: {err}");
                last = err;
            }
        }
    }
    Ok(Err(last))
}
