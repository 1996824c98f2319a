use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

static DEBUG_FILTER: OnceLock<Option<Vec<String>>> = OnceLock::new();
static DEBUG_EPOCH: OnceLock<Instant> = OnceLock::new();
static DEBUG_LOG_FILE: OnceLock<Option<Mutex<std::fs::File>>> = OnceLock::new();
const DEBUG_ENV: &str = "PAGEDRIVER_DEBUG";
const DEBUG_FILE_ENV: &str = "PAGEDRIVER_DEBUG_FILE";

/// Categories accepted by `PAGEDRIVER_DEBUG`: a comma-separated subset of
/// `driver`, `worker`, `interceptor`, or `1`/`all` for everything.
fn debug_filter() -> &'static Option<Vec<String>> {
    DEBUG_FILTER.get_or_init(|| {
        let value = std::env::var(DEBUG_ENV).ok()?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if value == "1" || value.eq_ignore_ascii_case("all") {
            return Some(Vec::new());
        }
        Some(
            value
                .split(',')
                .map(|part| part.trim().to_ascii_lowercase())
                .filter(|part| !part.is_empty())
                .collect(),
        )
    })
}

fn enabled(category: &str) -> bool {
    match debug_filter() {
        None => false,
        // An empty filter means "all categories".
        Some(filter) => filter.is_empty() || filter.iter().any(|c| c == category),
    }
}

fn debug_epoch() -> Instant {
    *DEBUG_EPOCH.get_or_init(Instant::now)
}

pub(crate) fn debug_log(category: &str, message: impl AsRef<str>) {
    if !enabled(category) {
        return;
    }
    let elapsed = debug_epoch().elapsed().as_millis();
    let line = format!(
        "[pagedriver][{category} +{elapsed:>6}ms] {}",
        message.as_ref()
    );
    let file = DEBUG_LOG_FILE.get_or_init(|| {
        let path = std::env::var(DEBUG_FILE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(Mutex::new)
    });
    match file {
        Some(file) => {
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(*guard, "{line}");
                let _ = guard.flush();
            }
        }
        None => eprintln!("{line}"),
    }
}
