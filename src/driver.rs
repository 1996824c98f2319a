use crate::channel::{Channel, ChannelError, ControllerEnds};
use crate::diagnostics::debug_log;
use crate::engine::{Capture, CaptureParams, SaveOptions};
use crate::interceptor::{InterceptorEndpoint, InterceptorPredicate};
use crate::protocol::{Command, EngineError, Reply, Value};

#[derive(Debug)]
pub enum DriverError {
    /// The operation reached the engine and the engine rejected it. The
    /// session stays usable.
    Engine(EngineError),
    /// The transport failed. Fatal: the session is closed and every further
    /// call returns `SessionClosed`.
    Transport(ChannelError),
    /// The session was already quit or torn down.
    SessionClosed,
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Engine(err) => write!(f, "{err}"),
            DriverError::Transport(err) => write!(f, "session transport failed: {err}"),
            DriverError::SessionClosed => write!(f, "session is closed"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Engine(err) => Some(err),
            DriverError::Transport(err) => Some(err),
            DriverError::SessionClosed => None,
        }
    }
}

impl From<ChannelError> for DriverError {
    fn from(err: ChannelError) -> Self {
        DriverError::Transport(err)
    }
}

/// Controller-side handle to one worker. All methods block until the worker
/// replies; at most one command is ever outstanding.
pub struct Driver {
    command: Option<Channel>,
    interceptor: InterceptorEndpoint,
}

impl Driver {
    /// Bind a driver to the controller half of a session, as produced by
    /// [`bridge_pair`](crate::channel::bridge_pair) or a process launch.
    pub fn connect(ends: ControllerEnds) -> Self {
        Self {
            command: Some(ends.command),
            interceptor: InterceptorEndpoint::new(ends.interceptor, ends.sentinel),
        }
    }

    pub fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.call_unit(Command::Navigate {
            url: url.to_string(),
        })
    }

    pub fn wait(&mut self, ms: u64) -> Result<(), DriverError> {
        self.call_unit(Command::Wait { ms })
    }

    pub fn download(
        &mut self,
        url: &str,
        filename: Option<&str>,
        progress: bool,
    ) -> Result<(), DriverError> {
        self.call_unit(Command::Download {
            url: url.to_string(),
            filename: filename.map(str::to_string),
            progress,
        })
    }

    pub fn run_script(&mut self, code: &str) -> Result<Value, DriverError> {
        self.call_value(Command::RunScript {
            code: code.to_string(),
        })
    }

    /// Text of the last script error, empty when there is none.
    pub fn last_script_error(&mut self) -> Result<String, DriverError> {
        match self.call_value(Command::LastScriptError)? {
            Value::Str(message) => Ok(message),
            other => Err(self.desync(format!("non-string script error reply: {other:?}"))),
        }
    }

    /// Capture pixels. The bytes arrive via the frame payload, byte-exact;
    /// `capture.bytes.len()` always equals `stride * height`.
    pub fn capture(&mut self, params: &CaptureParams) -> Result<Capture, DriverError> {
        let frame = self.call(Command::Capture { params: *params })?;
        match frame.message {
            Reply::Pixels {
                width,
                height,
                stride,
                format,
            } => {
                let expected = stride as usize * height as usize;
                if frame.payload.len() != expected {
                    return Err(self.desync(format!(
                        "pixel payload is {} bytes, header claims {expected}",
                        frame.payload.len()
                    )));
                }
                Ok(Capture {
                    bytes: frame.payload,
                    width,
                    height,
                    stride,
                    format,
                })
            }
            other => Err(self.desync(format!("non-pixel capture reply: {other:?}"))),
        }
    }

    /// Render to a file on the worker side. Returns the engine's success
    /// flag.
    pub fn save_capture(&mut self, path: &str, options: &SaveOptions) -> Result<bool, DriverError> {
        match self.call_value(Command::SaveCapture {
            path: path.to_string(),
            options: options.clone(),
        })? {
            Value::Bool(saved) => Ok(saved),
            other => Err(self.desync(format!("non-bool save reply: {other:?}"))),
        }
    }

    pub fn resize(&mut self, width: i32, height: i32) -> Result<(), DriverError> {
        self.call_unit(Command::Resize { width, height })
    }

    pub fn content_size(&mut self) -> Result<(i32, i32), DriverError> {
        let value = self.call_value(Command::ContentSize)?;
        if let Value::List(items) = &value
            && let [Value::Int(width), Value::Int(height)] = items.as_slice()
        {
            return Ok((*width as i32, *height as i32));
        }
        Err(self.desync(format!("malformed content size reply: {value:?}")))
    }

    pub fn scroll(&mut self, x: i32, y: i32) -> Result<(), DriverError> {
        self.call_unit(Command::Scroll { x, y })
    }

    pub fn set_devtools(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.call_unit(Command::SetDevtools { enabled })
    }

    /// Install a predicate and enable interception, or disable it with
    /// `None`. The listener thread starts on first enable and is reused by
    /// later enables on the same session.
    pub fn set_interceptor(
        &mut self,
        predicate: Option<InterceptorPredicate>,
    ) -> Result<(), DriverError> {
        match predicate {
            Some(predicate) => {
                // The predicate must be in place before the worker can start
                // asking.
                self.interceptor.install(Some(predicate));
                self.interceptor.ensure_started();
                self.call_unit(Command::SetInterceptor { enabled: true })
            }
            None => {
                self.call_unit(Command::SetInterceptor { enabled: false })?;
                self.interceptor.install(None);
                Ok(())
            }
        }
    }

    /// End the session. Idempotent: the first call tears everything down,
    /// later calls are no-ops. Never blocks on an unresponsive pipe beyond
    /// the writes themselves.
    pub fn quit(&mut self) {
        if let Some(mut channel) = self.command.take() {
            debug_log("driver", "quitting");
            // Best effort: a worker that already died has closed the pipe,
            // and that is fine.
            let _ = channel.send(&Command::Quit, &[]);
            // Dropping the channel closes both command pipe ends, which is
            // what unblocks the worker's listener.
        }
        self.interceptor.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.command.is_none()
    }

    fn call(&mut self, command: Command) -> Result<crate::channel::Frame<Reply>, DriverError> {
        let channel = self.command.as_mut().ok_or(DriverError::SessionClosed)?;
        debug_log("driver", format!("call: {}", command.name()));
        let outcome = channel
            .send(&command, &[])
            .and_then(|()| channel.recv::<Reply>());
        match outcome {
            Ok(frame) => {
                if let Reply::Err { error } = frame.message {
                    return Err(DriverError::Engine(error));
                }
                Ok(frame)
            }
            Err(err) => {
                debug_log("driver", format!("transport failed: {err}"));
                self.command = None;
                Err(DriverError::Transport(err))
            }
        }
    }

    fn call_unit(&mut self, command: Command) -> Result<(), DriverError> {
        self.call_value(command)?;
        Ok(())
    }

    fn call_value(&mut self, command: Command) -> Result<Value, DriverError> {
        match self.call(command)?.message {
            Reply::Value { value } => Ok(value),
            other => Err(self.desync(format!("unexpected reply shape: {other:?}"))),
        }
    }

    /// A reply that does not match the command is a protocol breach, not an
    /// engine error: close the session.
    fn desync(&mut self, message: String) -> DriverError {
        self.command = None;
        DriverError::Transport(ChannelError::Desync(message))
    }
}
