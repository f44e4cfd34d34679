use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Iteration-level hook for long sampler runs. Purely informational: no
/// sampler result depends on it. `()` is the no-op observer.
pub trait ProgressObserver: Sync {
    fn on_iteration(&self, _iteration: usize, _total: usize) {}

    fn on_divergence(&self) {}
}

impl ProgressObserver for () {}

/// Progress counters shared with a rendering thread.
///
/// The sampler bumps the atomics; a dedicated thread reads them and draws a
/// live bar on stderr, independent of the sampling loop.
pub struct ProgressState {
    pub label: String,
    pub total_iters: usize,
    pub num_warmup: usize,
    pub completed: AtomicUsize,
    pub divergences: AtomicUsize,
    pub done: AtomicBool,
    pub start_time: Instant,
}

impl ProgressState {
    pub fn new(label: impl Into<String>, num_warmup: usize, num_samples: usize) -> Self {
        Self {
            label: label.into(),
            total_iters: num_warmup + num_samples,
            num_warmup,
            completed: AtomicUsize::new(0),
            divergences: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

impl ProgressObserver for ProgressState {
    fn on_iteration(&self, _iteration: usize, _total: usize) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_divergence(&self) {
        self.divergences.fetch_add(1, Ordering::Relaxed);
    }
}

fn fmt_count(n: usize) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 10_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        format!("{}", n)
    }
}

fn fmt_time(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = (secs / 60.0) as usize;
        let s = (secs % 60.0) as usize;
        format!("{}:{:02}", mins, s)
    }
}

fn render(state: &ProgressState) {
    let completed = state.completed.load(Ordering::Relaxed);
    let total = state.total_iters;
    let divs = state.divergences.load(Ordering::Relaxed);
    let elapsed = state.start_time.elapsed().as_secs_f64();

    let pct = if total > 0 {
        (completed * 100 / total).min(100)
    } else {
        0
    };
    let speed = if elapsed > 0.05 {
        completed as f64 / elapsed
    } else {
        0.0
    };
    let remaining = if speed > 0.0 && completed < total {
        (total - completed) as f64 / speed
    } else {
        0.0
    };
    let phase = if completed < state.num_warmup {
        "warm-up"
    } else {
        "sampling"
    };

    let bar_width = 30;
    let filled = if total > 0 {
        (bar_width * completed.min(total)) / total
    } else {
        0
    };
    let bar: String = "━".repeat(filled) + &"╌".repeat(bar_width - filled);

    let is_done = state.done.load(Ordering::Relaxed);
    let mut err = std::io::stderr().lock();

    if is_done {
        let _ = write!(
            err,
            "\r{} {} {:>3}% │ {}/{} │ {} divergences │ {}\x1b[K\n",
            state.label,
            bar,
            pct,
            fmt_count(completed),
            fmt_count(total),
            divs,
            fmt_time(elapsed),
        );
    } else {
        let _ = write!(
            err,
            "\r{} [{}] {} {:>3}% │ {}/{} │ {} divs │ {:.0} it/s │ {} < ~{}\x1b[K",
            state.label,
            phase,
            bar,
            pct,
            fmt_count(completed),
            fmt_count(total),
            divs,
            speed,
            fmt_time(elapsed),
            fmt_time(remaining),
        );
    }
    let _ = err.flush();
}

/// Spawn a background thread that renders the progress bar at ~10 Hz.
/// Call `state.finish()` then `handle.join()` once the sampler returns.
pub fn spawn_progress_thread(state: Arc<ProgressState>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !state.done.load(Ordering::Relaxed) {
            render(&state);
            std::thread::sleep(Duration::from_millis(100));
        }
        render(&state);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_counts_events() {
        let state = ProgressState::new("HMC", 5, 10);
        for i in 0..7 {
            state.on_iteration(i, 15);
        }
        state.on_divergence();
        assert_eq!(state.completed.load(Ordering::Relaxed), 7);
        assert_eq!(state.divergences.load(Ordering::Relaxed), 1);
        assert_eq!(state.total_iters, 15);
    }

    #[test]
    fn test_render_thread_stops() {
        let state = Arc::new(ProgressState::new("MWG", 1, 1));
        let handle = spawn_progress_thread(Arc::clone(&state));
        state.on_iteration(0, 2);
        state.finish();
        handle.join().unwrap();
    }

    #[test]
    fn test_formatting() {
        assert_eq!(fmt_count(999), "999");
        assert_eq!(fmt_count(12_345), "12.3k");
        assert_eq!(fmt_time(75.0), "1:15");
    }
}
