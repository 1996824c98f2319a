//! Synchronous cross-process bridge for driving a page-rendering engine.
//!
//! A controller process spawns a worker process that owns the engine and
//! talks to it over two independent pipe channels: a command channel carrying
//! one blocking call/reply at a time, and an interceptor channel on which the
//! worker asks the controller for load/block verdicts about resource urls,
//! nested inside whatever command is in flight. Pixel captures travel as raw
//! frame payloads, byte-exact and unbounded.
//!
//! Controller side: [`Session`] spawns the worker and hands out a [`Driver`].
//! Worker side: the host binary implements [`Engine`] and calls
//! [`worker::run`] when started in worker mode. For tests and single-process
//! embedding, [`bridge_pair`] builds both halves over in-process pipes.

mod channel;
mod diagnostics;
mod dispatcher;
mod driver;
mod engine;
mod interceptor;
mod protocol;
#[cfg(target_family = "unix")]
mod session;
pub mod worker;

pub use channel::{
    Channel, ChannelError, ControllerEnds, Frame, FrameReader, FrameWriter, WorkerEnds,
    bridge_pair, channels_from_env,
};
pub use driver::{Driver, DriverError};
pub use engine::{
    Capture, CaptureParams, Engine, InterceptorFn, PixelView, SaveOptions, clamp_capture_rect,
};
pub use interceptor::InterceptorPredicate;
pub use protocol::{
    Command, EngineError, InterceptQuery, InterceptVerdict, Reply, Value, WORKER_MODE_ARG,
};
#[cfg(target_family = "unix")]
pub use session::Session;
