use log::{debug, info};

#[derive(Debug)]
pub struct MemoryStats {
    pub rss_mb: f64,
    pub vm_size_mb: f64,
    pub percent: Option<f64>,
}

#[cfg(target_os = "linux")]
pub fn get_memory_usage() -> Option<MemoryStats> {
    use std::fs::read_to_string;

    let status = read_to_string("/proc/self/status").ok()?;
    let meminfo = read_to_string("/proc/meminfo").ok();
    parse_proc_status(&status, meminfo.as_deref())
}

#[cfg(not(target_os = "linux"))]
pub fn get_memory_usage() -> Option<MemoryStats> {
    None
}

fn kb_field(text: &str, key: &str) -> Option<f64> {
    text.lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse::<f64>().ok())
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_status(status: &str, meminfo: Option<&str>) -> Option<MemoryStats> {
    let rss_kb = kb_field(status, "VmRSS:")?;
    let vm_size_kb = kb_field(status, "VmSize:")?;
    let percent = meminfo
        .and_then(|m| kb_field(m, "MemTotal:"))
        .filter(|total| *total > 0.0)
        .map(|total| rss_kb / total * 100.0);

    Some(MemoryStats {
        rss_mb: rss_kb / 1024.0,
        vm_size_mb: vm_size_kb / 1024.0,
        percent,
    })
}

pub fn log_memory_usage(note: &str) {
    match get_memory_usage() {
        Some(stats) => {
            let percent_str = stats
                .percent
                .map_or_else(|| "N/A".to_string(), |p| format!("{:.1}%", p));
            info!(
                "Memory usage ({}): {:.1} MB physical (RSS), {:.1} MB virtual, {} of system memory",
                note, stats.rss_mb, stats.vm_size_mb, percent_str
            );
        }
        None => debug!(
            "Memory usage tracking not available on this platform ({})",
            std::env::consts::OS
        ),
    }
}
