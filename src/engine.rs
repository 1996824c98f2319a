use serde::{Deserialize, Serialize};

use crate::protocol::{EngineError, Value};

/// Verdict callback installed into the engine while interception is enabled.
/// Returns `true` to let the resource load, `false` to block it. Invoked on
/// the engine thread only, synchronously inside whatever operation is in
/// flight.
pub type InterceptorFn = Box<dyn Fn(&str) -> bool>;

/// Rectangle and settling parameters for a pixel capture. Negative `width`
/// or `height` means "to the content edge".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureParams {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    /// When non-zero, the engine recaptures until two captures taken
    /// `settle_ms` apart are identical, or `max_iter` is reached.
    pub settle_ms: u64,
    pub max_iter: u32,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: -1,
            height: -1,
            settle_ms: 0,
            max_iter: 10,
        }
    }
}

/// Encoding options for `save_capture`. `quality` of -1 means the encoder's
/// default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveOptions {
    pub format: Option<String>,
    pub quality: i32,
    pub rect: CaptureParams,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            format: None,
            quality: -1,
            rect: CaptureParams::default(),
        }
    }
}

/// A borrowed view of the engine's framebuffer. The underlying bytes may be
/// mutated or freed as soon as the engine runs again, so the dispatcher
/// copies them into a protocol-owned buffer before anything else happens.
#[derive(Debug, Clone, Copy)]
pub struct PixelView<'a> {
    pub bytes: &'a [u8],
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    /// Engine-specific pixel format code, carried opaquely.
    pub format: i32,
}

impl PixelView<'_> {
    pub fn empty() -> Self {
        PixelView {
            bytes: &[],
            width: 0,
            height: 0,
            stride: 0,
            format: 0,
        }
    }
}

/// An owned pixel capture, as returned to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: i32,
}

impl Capture {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The rendering engine, owned by exactly one thread in the worker process.
/// The bridge dispatches the closed command set onto these methods; the
/// engine surface can grow without protocol changes by extending
/// `protocol::Command` alongside.
pub trait Engine {
    fn navigate(&mut self, url: &str) -> Result<(), EngineError>;

    fn wait(&mut self, ms: u64) -> Result<(), EngineError>;

    fn download(
        &mut self,
        url: &str,
        filename: Option<&str>,
        progress: bool,
    ) -> Result<(), EngineError>;

    /// Run a script and return its JSON-able result.
    fn run_script(&mut self, code: &str) -> Result<Value, EngineError>;

    /// Last script error text, empty when there is none.
    fn last_script_error(&mut self) -> Result<String, EngineError>;

    fn capture(&mut self, params: &CaptureParams) -> Result<PixelView<'_>, EngineError>;

    fn save_capture(&mut self, path: &str, options: &SaveOptions) -> Result<bool, EngineError>;

    /// Negative width/height means the current content dimension.
    fn resize(&mut self, width: i32, height: i32) -> Result<(), EngineError>;

    fn content_size(&mut self) -> Result<(i32, i32), EngineError>;

    fn scroll(&mut self, x: i32, y: i32) -> Result<(), EngineError>;

    fn set_devtools(&mut self, enabled: bool) -> Result<(), EngineError>;

    /// Install or clear the interception callback. While installed, the
    /// engine must consult it for every resource request and block the load
    /// when it returns `false`.
    fn set_interceptor(&mut self, interceptor: Option<InterceptorFn>) -> Result<(), EngineError>;
}

/// Clamp a requested capture rectangle against the content size.
///
/// Negative `w`/`h` extend to the content edge; rectangles crossing an edge
/// shrink to fit; a rectangle fully outside the content yields `None`
/// (an empty image).
pub fn clamp_capture_rect(
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    content_w: i32,
    content_h: i32,
) -> Option<(i32, i32, i32, i32)> {
    let mut w = if w < 0 { content_w } else { w.min(content_w - x) };
    let mut h = if h < 0 {
        content_h - y
    } else {
        h.min(content_h - y)
    };
    // A negative origin eats into the span rather than shifting the content.
    w = (w + x.min(0)).min(content_w);
    h = (h + y.min(0)).min(content_h);
    let x = x.max(0);
    let y = y.max(0);

    if x >= content_w || y >= content_h || w <= 0 || h <= 0 {
        return None;
    }
    Some((x, y, w, h))
}
