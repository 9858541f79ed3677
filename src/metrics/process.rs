use parking_lot::Mutex;
use std::fs;
use std::time::{Duration, Instant};

const PROC_STATUS: &str = "/proc/self/status";
const PROC_STAT: &str = "/proc/self/stat";
/// Unit of the times in `/proc/<pid>/stat` (USER_HZ), fixed at 100 on Linux.
const CLOCK_TICKS_PER_SECOND: u64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub threads: u64,
    pub resident_bytes: u64,
}

/// Reads thread count and resident set size of this process. Platforms
/// without procfs report zeros.
pub fn process_stats() -> ProcessStats {
    fs::read_to_string(PROC_STATUS)
        .map(|status| parse_status(&status))
        .unwrap_or_default()
}

fn parse_status(status: &str) -> ProcessStats {
    let mut stats = ProcessStats::default();
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let mut fields = value.split_whitespace();
        let amount = fields.next().and_then(|raw| raw.parse::<u64>().ok());
        match (key.trim(), amount) {
            ("Threads", Some(threads)) => stats.threads = threads,
            ("VmRSS", Some(kib)) => {
                stats.resident_bytes = match fields.next() {
                    Some("kB") | Some("KB") => kib.saturating_mul(1024),
                    _ => kib,
                }
            }
            _ => {}
        }
    }
    stats
}

/// User plus system CPU time consumed by this process so far. Platforms
/// without procfs report zero.
pub fn process_cpu_time() -> Duration {
    fs::read_to_string(PROC_STAT)
        .ok()
        .and_then(|stat| parse_cpu_ticks(&stat))
        .map(|ticks| Duration::from_millis(ticks.saturating_mul(1000) / CLOCK_TICKS_PER_SECOND))
        .unwrap_or_default()
}

fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may hold spaces and parentheses; fields resume after
    // the last ')', starting with field 3 (state).
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

/// CPU load of this process between consecutive samples, in per-mille of
/// one core.
pub struct CpuLoad {
    last: Mutex<(Instant, Duration)>,
}

impl CpuLoad {
    pub fn new() -> Self {
        Self {
            last: Mutex::new((Instant::now(), process_cpu_time())),
        }
    }

    pub fn sample(&self) -> u64 {
        let now = Instant::now();
        let cpu = process_cpu_time();
        let mut last = self.last.lock();
        let wall = now.duration_since(last.0);
        let used = cpu.saturating_sub(last.1);
        *last = (now, cpu);
        if wall.is_zero() {
            return 0;
        }
        (used.as_secs_f64() / wall.as_secs_f64() * 1000.0).round() as u64
    }
}

impl Default for CpuLoad {
    fn default() -> Self {
        Self::new()
    }
}
