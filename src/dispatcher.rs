use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use crate::channel::{Channel, ChannelError, FrameWriter};
use crate::diagnostics::debug_log;
use crate::engine::{Engine, InterceptorFn};
use crate::protocol::{Command, EngineError, InterceptQuery, InterceptVerdict, Reply, Value};

pub(crate) enum Flow {
    Continue,
    Quit,
}

/// Worker-side dispatcher. Runs on the engine-owning thread, one command at
/// a time: Idle -> Executing -> Idle. Every engine failure, including a
/// panic, becomes an `EngineError` reply; errors are call-scoped and the
/// next command is served normally.
pub(crate) struct Dispatcher<E: Engine> {
    engine: E,
    replies: FrameWriter,
    // Engine-thread-only state, shared with the interceptor callback.
    interceptor: Rc<RefCell<Channel>>,
}

impl<E: Engine> Dispatcher<E> {
    pub(crate) fn new(engine: E, replies: FrameWriter, interceptor: Channel) -> Self {
        Self {
            engine,
            replies,
            interceptor: Rc::new(RefCell::new(interceptor)),
        }
    }

    pub(crate) fn dispatch(&mut self, command: Command) -> Result<Flow, ChannelError> {
        debug_log("worker", format!("dispatch: {}", command.name()));
        if matches!(command, Command::Quit) {
            return Ok(Flow::Quit);
        }
        let name = command.name();
        let (reply, payload) = match catch_unwind(AssertUnwindSafe(|| self.execute(command))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => {
                debug_log("worker", format!("{name} failed: {error}"));
                (Reply::Err { error }, Vec::new())
            }
            Err(panic) => {
                let error = EngineError::Failure {
                    message: panic_message(panic.as_ref(), name),
                };
                debug_log("worker", format!("{name} panicked"));
                (Reply::Err { error }, Vec::new())
            }
        };
        self.replies.send(&reply, &payload)?;
        Ok(Flow::Continue)
    }

    /// Worker half of the quit sequence: clear the interceptor registration
    /// so the engine drops its channel handle, unblock the controller-side
    /// listener with the sentinel, then close both worker ends by dropping.
    pub(crate) fn shutdown(mut self) {
        let _ = self.engine.set_interceptor(None);
        let _ = self
            .interceptor
            .borrow_mut()
            .send(&InterceptQuery::sentinel(), &[]);
    }

    fn execute(&mut self, command: Command) -> Result<(Reply, Vec<u8>), EngineError> {
        let value = match command {
            Command::Navigate { url } => {
                self.engine.navigate(&url)?;
                Value::Null
            }
            Command::Wait { ms } => {
                self.engine.wait(ms)?;
                Value::Null
            }
            Command::Download {
                url,
                filename,
                progress,
            } => {
                self.engine.download(&url, filename.as_deref(), progress)?;
                Value::Null
            }
            Command::RunScript { code } => self.engine.run_script(&code)?,
            Command::LastScriptError => Value::Str(self.engine.last_script_error()?),
            Command::Capture { params } => {
                let view = self.engine.capture(&params)?;
                // Copy now: the engine may mutate or free its framebuffer the
                // moment it runs again.
                let bytes = view.bytes.to_vec();
                return Ok((
                    Reply::Pixels {
                        width: view.width,
                        height: view.height,
                        stride: view.stride,
                        format: view.format,
                    },
                    bytes,
                ));
            }
            Command::SaveCapture { path, options } => {
                Value::Bool(self.engine.save_capture(&path, &options)?)
            }
            Command::Resize { width, height } => {
                self.engine.resize(width, height)?;
                Value::Null
            }
            Command::ContentSize => {
                let (width, height) = self.engine.content_size()?;
                Value::List(vec![Value::Int(width.into()), Value::Int(height.into())])
            }
            Command::Scroll { x, y } => {
                self.engine.scroll(x, y)?;
                Value::Null
            }
            Command::SetDevtools { enabled } => {
                self.engine.set_devtools(enabled)?;
                Value::Null
            }
            Command::SetInterceptor { enabled } => {
                self.set_interceptor(enabled)?;
                Value::Null
            }
            Command::Quit => unreachable!("quit is intercepted in dispatch"),
        };
        Ok((Reply::Value { value }, Vec::new()))
    }

    fn set_interceptor(&mut self, enabled: bool) -> Result<(), EngineError> {
        if !enabled {
            return self.engine.set_interceptor(None);
        }
        let channel = Rc::clone(&self.interceptor);
        let callback: InterceptorFn = Box::new(move |url| {
            // Reentrant round-trip: this blocks the engine thread inside the
            // outer command until the controller answers.
            let mut channel = channel.borrow_mut();
            let query = InterceptQuery {
                url: url.to_string(),
            };
            if let Err(err) = channel.send(&query, &[]) {
                debug_log("worker", format!("intercept query failed: {err}"));
                return false;
            }
            match channel.recv::<InterceptVerdict>() {
                Ok(frame) => frame.message.allow,
                Err(err) => {
                    debug_log("worker", format!("intercept verdict failed: {err}"));
                    false
                }
            }
        });
        self.engine.set_interceptor(Some(callback))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send), op: &str) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string());
    format!("{op} panicked: {detail}")
}
