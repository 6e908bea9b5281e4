//! System metrics collection for the heartbeat.
//!
//! All reads are best-effort from `/proc`, `/sys`, and `statvfs("/")`;
//! unavailable values report as 0 (sizes, uptime) or -1 (temperature, load).
//!
//! | Field        | Source                                  |
//! |--------------|-----------------------------------------|
//! | `cpu_temp`   | `/sys/class/thermal/thermal_zone0/temp` |
//! | `mem_total`  | `/proc/meminfo` `MemTotal`              |
//! | `mem_free`   | `/proc/meminfo` `MemAvailable`          |
//! | `disk_*`     | `statvfs("/")`                          |
//! | `uptime`     | `/proc/uptime`                          |
//! | `load_avg`   | `/proc/loadavg` (1-minute)              |

use crate::protocol::MetricsReport;

/// Gather a metrics report for the next heartbeat.
pub fn collect() -> MetricsReport {
    let meminfo = read_file("/proc/meminfo");
    let (disk_total, disk_free) = disk_usage("/");
    MetricsReport {
        cpu_temp: cpu_temp(&read_file("/sys/class/thermal/thermal_zone0/temp")),
        mem_total: meminfo_field(&meminfo, "MemTotal"),
        mem_free: meminfo_field(&meminfo, "MemAvailable"),
        disk_total,
        disk_free,
        uptime: uptime_secs(&read_file("/proc/uptime")),
        load_avg: load_avg(&read_file("/proc/loadavg")),
    }
}

fn read_file(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// thermal_zone0 reports millidegrees; convert to °C, -1 when unreadable.
fn cpu_temp(raw: &str) -> f64 {
    match raw.trim().parse::<i64>() {
        #[allow(clippy::cast_precision_loss)]
        Ok(milli) => milli as f64 / 1000.0,
        Err(_) => -1.0,
    }
}

/// A `/proc/meminfo` field in bytes (the file reports kB).
fn meminfo_field(meminfo: &str, field: &str) -> u64 {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            let Some(rest) = rest.strip_prefix(':') else {
                continue;
            };
            return rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(0, |kb| kb * 1024);
        }
    }
    0
}

/// Root filesystem `(total, available)` bytes via `statvfs`.
fn disk_usage(path: &str) -> (u64, u64) {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let Ok(c_path) = CString::new(path) else {
        return (0, 0);
    };
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: statvfs is a standard POSIX call; we pass a valid C string and
    // a pointer to properly aligned memory.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return (0, 0);
    }
    // SAFETY: statvfs returned 0, so stat is fully initialized.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    let block_size = stat.f_frsize as u64;
    (stat.f_blocks * block_size, stat.f_bavail * block_size)
}

fn uptime_secs(raw: &str) -> i64 {
    #[allow(clippy::cast_possible_truncation)]
    raw.split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .map_or(0, |secs| secs as i64)
}

fn load_avg(raw: &str) -> f64 {
    raw.split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(-1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_temp_millidegrees() {
        assert_eq!(cpu_temp("48250\n"), 48.25);
        assert_eq!(cpu_temp(""), -1.0);
        assert_eq!(cpu_temp("garbage"), -1.0);
    }

    #[test]
    fn test_meminfo_field_kb_to_bytes() {
        let meminfo = "MemTotal:        3884352 kB\nMemFree:          123456 kB\nMemAvailable:    2621440 kB\n";
        assert_eq!(meminfo_field(meminfo, "MemTotal"), 3_884_352 * 1024);
        assert_eq!(meminfo_field(meminfo, "MemAvailable"), 2_621_440 * 1024);
        assert_eq!(meminfo_field(meminfo, "SwapTotal"), 0);
        // "MemFree" must not match "MemAvailable" by prefix confusion
        assert_eq!(meminfo_field(meminfo, "Mem"), 0);
    }

    #[test]
    fn test_uptime_parse() {
        assert_eq!(uptime_secs("12345.67 45678.90\n"), 12345);
        assert_eq!(uptime_secs(""), 0);
    }

    #[test]
    fn test_load_avg_parse() {
        assert_eq!(load_avg("0.52 0.58 0.59 1/389 12345\n"), 0.52);
        assert_eq!(load_avg(""), -1.0);
    }

    #[test]
    fn test_collect_does_not_panic() {
        // Values are platform-dependent; only the call contract matters.
        let report = collect();
        assert!(report.uptime >= 0);
    }
}
