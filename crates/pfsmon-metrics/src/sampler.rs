//! Metric samplers
//!
//! Each sampler reads one source and returns `(key, value)` pairs. Sources
//! are rooted at a configurable directory so tests can point them at a
//! fixture tree instead of `/proc`.

use pfsmon_core::{PfsError, Result};
use std::path::{Path, PathBuf};

/// Source of metric values
pub trait Sampler: Send + Sync {
    /// Subsystem tag attached to every sample
    fn subsystem(&self) -> &str;

    fn sample(&self) -> Result<Vec<(String, f64)>>;
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| PfsError::Other(format!("Failed to read {}: {}", path.display(), e)))
}

/// Load averages and run-queue size from `<proc>/loadavg`
pub struct LoadAvgSampler {
    path: PathBuf,
}

impl LoadAvgSampler {
    pub fn new(proc_root: impl AsRef<Path>) -> Self {
        Self {
            path: proc_root.as_ref().join("loadavg"),
        }
    }
}

impl Sampler for LoadAvgSampler {
    fn subsystem(&self) -> &str {
        "load"
    }

    fn sample(&self) -> Result<Vec<(String, f64)>> {
        parse_loadavg(&read(&self.path)?)
    }
}

/// Parse `0.52 0.58 0.59 2/845 12345`
pub fn parse_loadavg(content: &str) -> Result<Vec<(String, f64)>> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(PfsError::Other(format!("malformed loadavg: {}", content.trim())));
    }

    let mut values = Vec::with_capacity(5);
    for (key, field) in ["load.1m", "load.5m", "load.15m"].iter().zip(&fields) {
        let value = field
            .parse::<f64>()
            .map_err(|_| PfsError::Other(format!("malformed loadavg field: {}", field)))?;
        values.push((key.to_string(), value));
    }

    if let Some((running, total)) = fields.get(3).and_then(|f| f.split_once('/')) {
        if let (Ok(running), Ok(total)) = (running.parse::<f64>(), total.parse::<f64>()) {
            values.push(("procs.running".to_string(), running));
            values.push(("procs.total".to_string(), total));
        }
    }
    Ok(values)
}

/// Memory counters from `<proc>/meminfo`, in bytes
pub struct MemInfoSampler {
    path: PathBuf,
}

impl MemInfoSampler {
    pub fn new(proc_root: impl AsRef<Path>) -> Self {
        Self {
            path: proc_root.as_ref().join("meminfo"),
        }
    }
}

impl Sampler for MemInfoSampler {
    fn subsystem(&self) -> &str {
        "memory"
    }

    fn sample(&self) -> Result<Vec<(String, f64)>> {
        Ok(parse_meminfo(&read(&self.path)?))
    }
}

/// Parse `MemTotal:  16318508 kB` lines; unparsable lines are skipped
pub fn parse_meminfo(content: &str) -> Vec<(String, f64)> {
    content
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value: f64 = parts.next()?.parse().ok()?;
            let scale = match parts.next() {
                Some("kB") => 1024.0,
                _ => 1.0,
            };
            Some((name.trim().to_string(), value * scale))
        })
        .collect()
}

/// Counters from parallel-filesystem `stats` files under a directory
///
/// Every file named `stats` or `*_stats` below the root is read; keys are
/// prefixed with the file's path relative to the root, dot-separated.
pub struct StatsSampler {
    root: PathBuf,
}

impl StatsSampler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stats_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(PfsError::Other(format!(
                "No stats directory at {}",
                self.root.display()
            )));
        }

        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        let mut found = Vec::new();
        for name in ["stats", "*_stats"] {
            let pattern = format!("{}/**/{}", root, name);
            let paths = glob::glob(&pattern).map_err(|e| {
                PfsError::Other(format!("Invalid stats pattern {}: {}", pattern, e))
            })?;
            found.extend(paths.flatten().filter(|p| p.is_file()));
        }

        found.sort();
        found.dedup();
        Ok(found)
    }

    fn prefix(&self, file: &Path) -> String {
        file.strip_prefix(&self.root)
            .unwrap_or(file)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl Sampler for StatsSampler {
    fn subsystem(&self) -> &str {
        "pfs"
    }

    fn sample(&self) -> Result<Vec<(String, f64)>> {
        let mut values = Vec::new();
        for file in self.stats_files()? {
            let prefix = self.prefix(&file);
            for (key, value) in parse_stats(&read(&file)?) {
                values.push((format!("{}.{}", prefix, key), value));
            }
        }
        Ok(values)
    }
}

/// Parse Lustre-style stats lines
///
/// `name count samples [unit] min max sum [sumsq]` yields `name.count`, and
/// `name.sum` when a sum is present. `snapshot_time` and similar lines
/// without a `samples` column are ignored.
pub fn parse_stats(content: &str) -> Vec<(String, f64)> {
    let mut values = Vec::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[2] != "samples" {
            continue;
        }
        let Ok(count) = fields[1].parse::<f64>() else {
            continue;
        };
        values.push((format!("{}.count", fields[0]), count));

        // fields[3] is the unit, then min max sum
        if let Some(sum) = fields.get(6).and_then(|f| f.parse::<f64>().ok()) {
            values.push((format!("{}.sum", fields[0]), sum));
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_loadavg() {
        let values = parse_loadavg("0.52 0.58 0.59 2/845 12345\n").unwrap();
        assert_eq!(values[0], ("load.1m".to_string(), 0.52));
        assert_eq!(values[2], ("load.15m".to_string(), 0.59));
        assert_eq!(values[3], ("procs.running".to_string(), 2.0));
        assert_eq!(values[4], ("procs.total".to_string(), 845.0));

        assert!(parse_loadavg("garbage").is_err());
    }

    #[test]
    fn test_parse_meminfo_scales_kb() {
        let values = parse_meminfo("MemTotal:       2048 kB\nHugePages_Total:       4\nbogus\n");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], ("MemTotal".to_string(), 2048.0 * 1024.0));
        assert_eq!(values[1], ("HugePages_Total".to_string(), 4.0));
    }

    #[test]
    fn test_parse_stats() {
        let content = "\
snapshot_time             1409777887.590578 secs.usecs
req_waittime              1300 samples [usec] 7 1239 91567 16383839
open                      3 samples [reqs]
";
        let values = parse_stats(content);
        assert_eq!(
            values,
            vec![
                ("req_waittime.count".to_string(), 1300.0),
                ("req_waittime.sum".to_string(), 91567.0),
                ("open.count".to_string(), 3.0),
            ]
        );
    }

    #[test]
    fn test_samplers_read_from_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("loadavg"), "1.00 2.00 3.00 1/10 99\n").unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemFree: 10 kB\n").unwrap();

        let ost = dir.path().join("obdfilter").join("pfs-OST0000");
        std::fs::create_dir_all(&ost).unwrap();
        std::fs::write(ost.join("stats"), "write_bytes 5 samples [bytes] 1 10 40\n").unwrap();

        let load = LoadAvgSampler::new(dir.path()).sample().unwrap();
        assert_eq!(load.len(), 5);

        let mem = MemInfoSampler::new(dir.path()).sample().unwrap();
        assert_eq!(mem, vec![("MemFree".to_string(), 10240.0)]);

        let stats = StatsSampler::new(dir.path()).sample().unwrap();
        assert_eq!(
            stats,
            vec![
                ("obdfilter.pfs-OST0000.stats.write_bytes.count".to_string(), 5.0),
                ("obdfilter.pfs-OST0000.stats.write_bytes.sum".to_string(), 40.0),
            ]
        );
    }

    #[test]
    fn test_missing_source_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(LoadAvgSampler::new(dir.path()).sample().is_err());
    }

    #[test]
    fn test_stats_files_found_at_any_depth() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stats"), "open 1 samples [reqs]\n").unwrap();

        let mdt = dir.path().join("mdt").join("pfs-MDT0000");
        std::fs::create_dir_all(mdt.join("exports")).unwrap();
        std::fs::write(mdt.join("md_stats"), "open 2 samples [reqs]\n").unwrap();
        std::fs::write(mdt.join("exports").join("stats"), "close 3 samples [reqs]\n").unwrap();
        std::fs::write(mdt.join("uuid"), "not a stats file\n").unwrap();
        // A directory named like a stats file is not read
        std::fs::create_dir_all(dir.path().join("job_stats")).unwrap();

        let sampler = StatsSampler::new(dir.path());
        let files: Vec<String> = sampler
            .stats_files()
            .unwrap()
            .iter()
            .map(|f| sampler.prefix(f))
            .collect();
        assert_eq!(
            files,
            vec![
                "mdt.pfs-MDT0000.exports.stats",
                "mdt.pfs-MDT0000.md_stats",
                "stats",
            ]
        );

        assert!(StatsSampler::new(dir.path().join("missing")).sample().is_err());
    }
}
