//! Worker-process entry points. A host binary embeds its engine and calls
//! [`run`] when it was spawned in worker mode; everything else (listener
//! thread, dispatch loop, shutdown ordering) lives here.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;

use crate::channel::{ChannelError, FrameReader, WorkerEnds, channels_from_env};
use crate::diagnostics::debug_log;
use crate::dispatcher::{Dispatcher, Flow};
use crate::engine::Engine;
use crate::protocol::{Command, WORKER_MODE_ARG};

/// True when the process was spawned as a session worker.
pub fn is_worker_mode() -> bool {
    std::env::args()
        .skip(1)
        .any(|arg| arg == WORKER_MODE_ARG || arg == "--worker")
}

/// Bind the channels inherited from the controller and serve commands until
/// quit or disconnect. Does not return until the session is over.
pub fn run<E: Engine>(engine: E) -> io::Result<()> {
    let ends = channels_from_env()?;
    // Ctrl-C in the controller's terminal is delivered to the whole
    // foreground group; shutdown must stay command-driven.
    #[cfg(target_family = "unix")]
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
    run_with_channels(engine, ends);
    Ok(())
}

/// Serve a session over pre-built channel ends. The engine lives and dies on
/// the calling thread; a named listener thread reads command frames and hands
/// them over one at a time.
pub fn run_with_channels<E: Engine>(engine: E, ends: WorkerEnds) {
    let WorkerEnds {
        command,
        interceptor,
    } = ends;
    let (commands, replies) = command.split();
    let mut dispatcher = Dispatcher::new(engine, replies, interceptor);

    let alive = Arc::new(AtomicBool::new(true));
    // Zero-capacity rendezvous: the listener cannot take command N+1 off the
    // pipe until the engine thread has accepted command N.
    let (mailbox, inbox) = mpsc::sync_channel::<Command>(0);
    let listener = {
        let alive = Arc::clone(&alive);
        thread::Builder::new()
            .name("pagedriver-listener".to_string())
            .spawn(move || listen(commands, mailbox, alive))
            .expect("failed to spawn command listener")
    };

    debug_log("worker", "serving");
    while let Ok(command) = inbox.recv() {
        match dispatcher.dispatch(command) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => {
                alive.store(false, Ordering::SeqCst);
                dispatcher.shutdown();
                break;
            }
            Err(err) => {
                debug_log("worker", format!("reply send failed: {err}"));
                alive.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
    let _ = listener.join();
    debug_log("worker", "stopped");
}

fn listen(mut commands: FrameReader, mailbox: mpsc::SyncSender<Command>, alive: Arc<AtomicBool>) {
    loop {
        let command = match commands.recv::<Command>() {
            Ok(frame) => frame.message,
            Err(ChannelError::Closed) => {
                debug_log("worker", "command stream closed");
                break;
            }
            Err(err) => {
                debug_log("worker", format!("command stream error: {err}"));
                break;
            }
        };
        if !alive.load(Ordering::SeqCst) || mailbox.send(command).is_err() {
            break;
        }
    }
}
