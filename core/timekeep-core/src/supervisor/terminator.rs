//! Platform termination strategies for the worker process.
//!
//! Windows workers spawn helper processes that do not die with their parent,
//! so termination there goes through `taskkill /T` to take down the whole
//! tree. Everywhere else a direct signal to the worker is enough.

use std::io;
use std::process::{Child, Command};

pub trait ProcessTerminator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Asks the process to exit on its own.
    fn request_shutdown(&self, child: &Child) -> io::Result<()>;

    /// Ends the process unconditionally.
    fn force_kill(&self, child: &mut Child) -> io::Result<()>;
}

/// SIGTERM for the graceful request, SIGKILL to force.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalTerminator;

impl ProcessTerminator for SignalTerminator {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn request_shutdown(&self, child: &Child) -> io::Result<()> {
        #[cfg(unix)]
        {
            // SAFETY: libc::kill has no memory-safety preconditions. The pid
            // belongs to a Child we still own and have not waited on, so the
            // kernel cannot have recycled it for another process. SIGTERM only
            // asks the worker to exit; ESRCH comes back if it already has.
            #[allow(unsafe_code)]
            let rc = unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child;
            Ok(())
        }
    }

    fn force_kill(&self, child: &mut Child) -> io::Result<()> {
        child.kill()
    }
}

/// `taskkill /T` for the graceful request, `taskkill /T /F` to force.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeTerminator;

impl ProcessTerminator for TreeTerminator {
    fn name(&self) -> &'static str {
        "process-tree"
    }

    fn request_shutdown(&self, child: &Child) -> io::Result<()> {
        run_taskkill(child.id(), false)
    }

    fn force_kill(&self, child: &mut Child) -> io::Result<()> {
        match run_taskkill(child.id(), true) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, pid = child.id(), "taskkill failed; killing worker directly");
                child.kill()
            }
        }
    }
}

fn run_taskkill(pid: u32, force: bool) -> io::Result<()> {
    let mut command = Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        command.arg("/F");
    }
    let output = command.output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "taskkill exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }
}

/// The strategy for the platform this binary was built for.
pub fn platform_terminator() -> Box<dyn ProcessTerminator> {
    if cfg!(windows) {
        Box::new(TreeTerminator)
    } else {
        Box::new(SignalTerminator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_terminator_matches_target_family() {
        let terminator = platform_terminator();
        if cfg!(windows) {
            assert_eq!(terminator.name(), "process-tree");
        } else {
            assert_eq!(terminator.name(), "signal");
        }
    }

    #[cfg(unix)]
    #[test]
    fn signal_terminator_stops_a_sleeping_child() {
        use std::process::Stdio;

        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        SignalTerminator
            .request_shutdown(&child)
            .expect("send SIGTERM");
        let status = child.wait().expect("wait for sleep");
        assert!(!status.success());
    }
}
