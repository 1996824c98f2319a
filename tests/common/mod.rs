#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use pagedriver::{
    CaptureParams, Driver, Engine, EngineError, InterceptorFn, PixelView, SaveOptions, Value,
    bridge_pair, clamp_capture_rect, worker,
};

/// Shared observation handle. The engine moves onto the worker thread; tests
/// keep a clone of the probe to assert on what the engine actually did.
#[derive(Clone, Default)]
pub struct EngineProbe {
    inner: Arc<Mutex<ProbeState>>,
}

#[derive(Default)]
struct ProbeState {
    ops: Vec<String>,
    loaded: Vec<String>,
    blocked: Vec<String>,
}

impl EngineProbe {
    pub fn ops(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn loaded(&self) -> Vec<String> {
        self.inner.lock().unwrap().loaded.clone()
    }

    pub fn blocked(&self) -> Vec<String> {
        self.inner.lock().unwrap().blocked.clone()
    }

    fn record(&self, op: String) {
        self.inner.lock().unwrap().ops.push(op);
    }

    fn record_load(&self, url: &str, allowed: bool) {
        let mut state = self.inner.lock().unwrap();
        if allowed {
            state.loaded.push(url.to_string());
        } else {
            state.blocked.push(url.to_string());
        }
    }
}

/// Deterministic pixel value for content coordinate (x, y), channel c.
pub fn pixel_at(x: i32, y: i32, c: i32) -> u8 {
    ((x * 7 + y * 13 + c) % 251) as u8
}

pub const BGRA: i32 = 4;

/// A fake engine with scripted behavior:
/// - every navigate requests the configured resource urls, consulting the
///   installed interceptor for each;
/// - urls containing `#fail` fail to navigate, downloads ending in
///   `.forbidden` are rejected;
/// - scripts of the form `throw <msg>` raise and set the last script error;
/// - captures render `pixel_at` over the clamped rectangle.
pub struct ScriptedEngine {
    probe: EngineProbe,
    content: (i32, i32),
    resources: Vec<String>,
    interceptor: Option<InterceptorFn>,
    last_script_error: String,
    framebuffer: Vec<u8>,
}

impl ScriptedEngine {
    pub fn new(probe: EngineProbe) -> Self {
        Self {
            probe,
            content: (800, 600),
            resources: Vec::new(),
            interceptor: None,
            last_script_error: String::new(),
            framebuffer: Vec::new(),
        }
    }

    pub fn with_content_size(mut self, width: i32, height: i32) -> Self {
        self.content = (width, height);
        self
    }

    pub fn with_resources(mut self, urls: &[&str]) -> Self {
        self.resources = urls.iter().map(|url| url.to_string()).collect();
        self
    }

    fn render(&self, x: i32, y: i32, w: i32, h: i32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(w as usize * h as usize * 4);
        for row in 0..h {
            for col in 0..w {
                for c in 0..4 {
                    bytes.push(pixel_at(x + col, y + row, c));
                }
            }
        }
        bytes
    }
}

impl Engine for ScriptedEngine {
    fn navigate(&mut self, url: &str) -> Result<(), EngineError> {
        self.probe.record(format!("navigate {url}"));
        if url.contains("#fail") {
            return Err(EngineError::Failure {
                message: format!("cannot load {url}"),
            });
        }
        for resource in &self.resources {
            let allowed = match &self.interceptor {
                Some(interceptor) => interceptor(resource),
                None => true,
            };
            self.probe.record_load(resource, allowed);
        }
        Ok(())
    }

    fn wait(&mut self, ms: u64) -> Result<(), EngineError> {
        self.probe.record(format!("wait {ms}"));
        Ok(())
    }

    fn download(
        &mut self,
        url: &str,
        filename: Option<&str>,
        progress: bool,
    ) -> Result<(), EngineError> {
        self.probe
            .record(format!("download {url} {filename:?} {progress}"));
        if url.ends_with(".forbidden") {
            return Err(EngineError::Download {
                message: format!("{url} rejected by server"),
            });
        }
        Ok(())
    }

    fn run_script(&mut self, code: &str) -> Result<Value, EngineError> {
        self.probe.record(format!("run_script {code}"));
        if let Some(message) = code.strip_prefix("throw ") {
            self.last_script_error = message.to_string();
            return Err(EngineError::Script {
                message: message.to_string(),
            });
        }
        Ok(match code {
            "1 + 1" => Value::Int(2),
            "document.title" => Value::Str("Example Domain".to_string()),
            "flags" => Value::List(vec![Value::Bool(true), Value::Null, Value::Float(0.5)]),
            _ => Value::Null,
        })
    }

    fn last_script_error(&mut self) -> Result<String, EngineError> {
        Ok(self.last_script_error.clone())
    }

    fn capture(&mut self, params: &CaptureParams) -> Result<PixelView<'_>, EngineError> {
        self.probe.record(format!(
            "capture {},{} {}x{}",
            params.x, params.y, params.width, params.height
        ));
        let (content_w, content_h) = self.content;
        let Some((x, y, w, h)) = clamp_capture_rect(
            params.x,
            params.y,
            params.width,
            params.height,
            content_w,
            content_h,
        ) else {
            return Ok(PixelView::empty());
        };
        self.framebuffer = self.render(x, y, w, h);
        Ok(PixelView {
            bytes: &self.framebuffer,
            width: w,
            height: h,
            stride: w * 4,
            format: BGRA,
        })
    }

    fn save_capture(&mut self, path: &str, options: &SaveOptions) -> Result<bool, EngineError> {
        self.probe.record(format!("save_capture {path}"));
        let rect = &options.rect;
        let (content_w, content_h) = self.content;
        let Some((x, y, w, h)) =
            clamp_capture_rect(rect.x, rect.y, rect.width, rect.height, content_w, content_h)
        else {
            return Ok(false);
        };
        std::fs::write(path, self.render(x, y, w, h)).map_err(|err| EngineError::Failure {
            message: format!("write {path}: {err}"),
        })?;
        Ok(true)
    }

    fn resize(&mut self, width: i32, height: i32) -> Result<(), EngineError> {
        self.probe.record(format!("resize {width}x{height}"));
        if width >= 0 {
            self.content.0 = width;
        }
        if height >= 0 {
            self.content.1 = height;
        }
        Ok(())
    }

    fn content_size(&mut self) -> Result<(i32, i32), EngineError> {
        self.probe.record("content_size".to_string());
        Ok(self.content)
    }

    fn scroll(&mut self, x: i32, y: i32) -> Result<(), EngineError> {
        self.probe.record(format!("scroll {x},{y}"));
        Ok(())
    }

    fn set_devtools(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.probe.record(format!("set_devtools {enabled}"));
        Ok(())
    }

    fn set_interceptor(&mut self, interceptor: Option<InterceptorFn>) -> Result<(), EngineError> {
        self.probe
            .record(format!("set_interceptor {}", interceptor.is_some()));
        self.interceptor = interceptor;
        Ok(())
    }
}

/// Both halves of a session in one process: the worker loop runs on its own
/// thread over real OS pipes, the test drives the controller half.
pub struct Bridge {
    pub driver: Driver,
    worker: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn start<F>(build: F) -> Bridge
    where
        F: FnOnce() -> ScriptedEngine + Send + 'static,
    {
        let (controller, worker_ends) = bridge_pair().expect("failed to create session pipes");
        let worker = thread::Builder::new()
            .name("test-worker".to_string())
            .spawn(move || worker::run_with_channels(build(), worker_ends))
            .expect("failed to spawn test worker");
        Bridge {
            driver: Driver::connect(controller),
            worker: Some(worker),
        }
    }

    /// Quit and join the worker thread, propagating its panics.
    pub fn finish(mut self) {
        self.driver.quit();
        if let Some(worker) = self.worker.take() {
            worker.join().expect("worker thread panicked");
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.driver.quit();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
