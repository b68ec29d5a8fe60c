use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Timezone archive timestamps are rendered in unless configured otherwise.
pub const DEFAULT_ARCHIVE_TIMEZONE: &str = "Asia/Kolkata";

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|err| anyhow!("invalid timezone `{name}`: {err}"))
}

pub fn now_in(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

/// RFC 3339 timestamp in `tz`, the format every manifest and checkpoint uses.
pub fn now_iso(tz: Tz) -> String {
    now_in(tz).to_rfc3339()
}

/// Name for a rotated part, e.g. `part-20250101T120000`.
pub fn part_name_at(at: &DateTime<Tz>) -> String {
    format!("part-{}", at.format("%Y%m%dT%H%M%S"))
}

/// Render a byte count the way the index files always have: integer bytes,
/// two decimals for everything larger.
pub fn format_size(size_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size_bytes as f64;
    let mut unit = 0usize;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size_bytes} {}", UNITS[0])
    } else {
        format!("{size:.2} {}", UNITS[unit])
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_size_matches_index_convention() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn part_names_are_second_resolution() {
        let tz = parse_timezone("UTC").unwrap();
        let at = tz.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(part_name_at(&at), "part-20250101T120000");
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus").is_err());
    }
}
