use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const CLEAR_LINE: &str = "\x1b[2K\r";

const PRINT_INTERVAL: Duration = Duration::from_millis(500);
const SAMPLE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    points: u64,
}

#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<Sample>,
}

impl Series {
    fn push(&mut self, at: Instant, points: u64, window: Duration) {
        self.samples.push_back(Sample { at, points });

        // Evict from the front until the span fits the window, but always
        // keep two samples so one interval remains measurable.
        while self.samples.len() > 2 {
            let span = self
                .samples
                .back()
                .map(|back| back.at)
                .unwrap_or(at)
                .saturating_duration_since(self.samples[0].at);
            if span <= window {
                break;
            }
            self.samples.pop_front();
        }
    }

    fn rate(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        let points: u64 = self.samples.iter().map(|s| s.points).sum();
        points as f64 / elapsed
    }
}

#[derive(Debug, Default)]
struct Inner {
    total: Series,
    devices: BTreeMap<usize, Series>,
    last_print: Option<Instant>,
}

/// Sliding-window throughput tracker: one global series plus one per device.
///
/// `record` also drives the single rewritable terminal line, rate-limited to
/// one report per print interval. One lock guards everything; the report runs
/// inside the same critical section `record` takes.
pub struct SpeedSampler {
    window: Duration,
    print_interval: Duration,
    inner: Mutex<Inner>,
}

impl Default for SpeedSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedSampler {
    pub fn new() -> Self {
        Self::with_intervals(PRINT_INTERVAL, SAMPLE_WINDOW)
    }

    pub fn with_intervals(print_interval: Duration, window: Duration) -> Self {
        Self {
            window,
            print_interval,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record(&self, points: u64, device: usize) {
        self.record_at(Instant::now(), points, device);
    }

    fn record_at(&self, now: Instant, points: u64, device: usize) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };

        inner.total.push(now, points, self.window);
        inner
            .devices
            .entry(device)
            .or_default()
            .push(now, points, self.window);

        let due = inner
            .last_print
            .map_or(true, |at| now.saturating_duration_since(at) >= self.print_interval);
        if due {
            inner.last_print = Some(now);
            report(&inner);
        }
    }

    pub fn total_rate(&self) -> f64 {
        match self.inner.lock() {
            Ok(inner) => inner.total.rate(),
            Err(poisoned) => poisoned.into_inner().total.rate(),
        }
    }

    pub fn device_rate(&self, device: usize) -> f64 {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.devices.get(&device).map_or(0.0, Series::rate)
    }
}

fn report(inner: &Inner) {
    let mut line = format!("Speed: {}", format_speed(inner.total.rate()));
    for (index, series) in &inner.devices {
        line.push_str(&format!(" GPU{index}: {}", format_speed(series.rate())));
    }

    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "{CLEAR_LINE}{line}\r");
    let _ = stderr.flush();
}

pub fn format_speed(rate: f64) -> String {
    const SUFFIXES: [char; 5] = [' ', 'K', 'M', 'G', 'T'];

    let mut scaled = rate;
    let mut index = 0;
    while scaled > 1000.0 && index + 1 < SUFFIXES.len() {
        scaled /= 1000.0;
        index += 1;
    }

    format!("{scaled:.3} {}H/s", SUFFIXES[index])
}
