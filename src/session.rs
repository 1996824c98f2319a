//! Launching and owning a worker process. Unix only: channel descriptors are
//! inherited across exec and named through the environment.

use std::ffi::OsStr;
use std::io;
use std::process::{Child, Command as ProcessCommand};

use crate::channel::create_process_ends;
use crate::diagnostics::debug_log;
use crate::driver::Driver;
use crate::protocol::{
    CMD_READ_FD_ENV, CMD_WRITE_FD_ENV, INTERCEPT_READ_FD_ENV, INTERCEPT_WRITE_FD_ENV,
    WORKER_MODE_ARG,
};

/// One controller-owned worker process plus the driver bound to it. Dropping
/// the session quits the worker and reaps it.
pub struct Session {
    driver: Driver,
    child: Option<Child>,
}

impl Session {
    /// Spawn `program` in worker mode with the standard worker argument.
    pub fn spawn(program: impl AsRef<OsStr>) -> io::Result<Session> {
        let mut command = ProcessCommand::new(program);
        command.arg(WORKER_MODE_ARG);
        Session::launch(&mut command)
    }

    /// Launch a fully caller-configured worker command. The four channel
    /// descriptors are appended to its environment; the worker binds them
    /// with [`channels_from_env`](crate::channel::channels_from_env).
    pub fn launch(command: &mut ProcessCommand) -> io::Result<Session> {
        let (ends, child_fds) = create_process_ends()?;
        command
            .env(CMD_READ_FD_ENV, child_fds.cmd_read.to_string())
            .env(CMD_WRITE_FD_ENV, child_fds.cmd_write.to_string())
            .env(INTERCEPT_READ_FD_ENV, child_fds.intercept_read.to_string())
            .env(INTERCEPT_WRITE_FD_ENV, child_fds.intercept_write.to_string());
        // Its own process group, so terminal signals aimed at the controller
        // never reach the worker.
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                child_fds.close();
                return Err(err);
            }
        };
        // The worker owns its copies now. Keeping ours would stop
        // end-of-stream from ever reaching its listener.
        child_fds.close();

        if let Some(status) = child.try_wait()? {
            return Err(io::Error::other(format!(
                "worker exited during startup: {status}"
            )));
        }
        debug_log("driver", format!("worker pid {}", child.id()));
        Ok(Session {
            driver: Driver::connect(ends),
            child: Some(child),
        })
    }

    pub fn driver(&mut self) -> &mut Driver {
        &mut self.driver
    }

    /// End the session and reap the worker. Idempotent.
    pub fn quit(&mut self) -> io::Result<()> {
        self.driver.quit();
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            debug_log("driver", format!("worker exited: {status}"));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.quit();
    }
}
