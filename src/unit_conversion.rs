use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

static MEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<value>\d+(?:\.\d+)?)\s*(?P<unit>[KMGTPE]i?)?B?$").unwrap());

static DURATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?P<value>\d+)\s*(?P<unit>[wdhms])").unwrap());

/// Convert a string representation of memory to a number of bytes.
///
/// Accepts plain byte counts and the binary/decimal suffixes used in
/// Kubernetes quantities (`1Gi`, `512Mi`, `2G`, ...).
pub fn memory_to_bytes(memory: &str) -> Result<i64, String> {
    let memory = memory.trim();
    let captures = MEMORY_RE
        .captures(memory)
        .ok_or_else(|| format!("Invalid memory quantity \"{memory}\""))?;
    let value: f64 = captures["value"]
        .parse()
        .map_err(|_| format!("Invalid memory quantity \"{memory}\""))?;
    let multiplier: f64 = match captures.name("unit").map(|u| u.as_str()) {
        None => 1.0,
        Some("K") => 1e3,
        Some("M") => 1e6,
        Some("G") => 1e9,
        Some("T") => 1e12,
        Some("P") => 1e15,
        Some("E") => 1e18,
        Some("Ki") => 1024.0,
        Some("Mi") => 1024.0 * 1024.0,
        Some("Gi") => 1024.0 * 1024.0 * 1024.0,
        Some("Ti") => 1024.0_f64.powi(4),
        Some("Pi") => 1024.0_f64.powi(5),
        Some("Ei") => 1024.0_f64.powi(6),
        Some(unit) => return Err(format!("Invalid memory unit \"{unit}\"")),
    };
    Ok((value * multiplier) as i64)
}

/// Convert a number of bytes into a human-readable binary SI string.
///
/// The result uses units that could appear in a Kubernetes spec, like `3Gi`.
pub fn bytes_to_si(value: i64) -> String {
    let units = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
    let mut best = value as f64;
    let mut best_unit = "";
    for unit in units {
        if best.abs() < 1024.0 {
            break;
        }
        best /= 1024.0;
        best_unit = unit;
    }
    if best.fract() == 0.0 {
        format!("{}{}", best as i64, best_unit)
    } else {
        format!("{best:.1}{best_unit}")
    }
}

/// Convert a Kubernetes CPU resource value to a float number of cores.
///
/// https://kubernetes.io/docs/concepts/configuration/manage-resources-containers/#meaning-of-cpu
pub fn cpu_to_cores(cpu: &str) -> Result<f64, String> {
    let msg = "CPU must be specified as a whole number of milli-cores, like 500m, or a decimal \
               number with no more than three places of precision, like 1.234";
    if let Some(millis) = cpu.strip_suffix('m') {
        let millis: f64 = millis.parse().map_err(|_| msg.to_string())?;
        return Ok(millis / 1000.0);
    }
    let cores: f64 = cpu.parse().map_err(|_| msg.to_string())?;
    if let Some((_, fraction)) = cpu.split_once('.') {
        if fraction.len() > 3 {
            return Err(msg.to_string());
        }
    }
    Ok(cores)
}

/// Parse a human-friendly duration such as `5m`, `1h30m`, or `4w`.
///
/// A bare integer is interpreted as seconds.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("Invalid duration \"\"".to_string());
    }
    if let Ok(seconds) = text.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    let mut seconds = 0u64;
    let mut matched = 0;
    for captures in DURATION_RE.captures_iter(text) {
        let value: u64 = captures["value"]
            .parse()
            .map_err(|_| format!("Invalid duration \"{text}\""))?;
        seconds += value
            * match &captures["unit"] {
                "w" => 604_800,
                "d" => 86_400,
                "h" => 3_600,
                "m" => 60,
                _ => 1,
            };
        matched += captures[0].len();
    }
    let significant = text.chars().filter(|c| !c.is_whitespace()).count();
    if matched == 0 || matched < significant {
        return Err(format!("Invalid duration \"{text}\""));
    }
    Ok(Duration::from_secs(seconds))
}

/// Format a duration the same way `parse_duration` reads it.
pub fn format_duration(duration: Duration) -> String {
    let mut seconds = duration.as_secs();
    let days = seconds / 86_400;
    seconds %= 86_400;
    let hours = seconds / 3_600;
    seconds %= 3_600;
    let minutes = seconds / 60;
    seconds %= 60;
    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d"));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{seconds}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_to_bytes() {
        assert_eq!(memory_to_bytes("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(memory_to_bytes("1.5Gi").unwrap(), 1024 * 1024 * 1024 * 3 / 2);
        assert_eq!(memory_to_bytes("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(memory_to_bytes("2G").unwrap(), 2_000_000_000);
        assert_eq!(memory_to_bytes("12345").unwrap(), 12345);
        assert!(memory_to_bytes("24D").is_err());
        assert!(memory_to_bytes("lots").is_err());
    }

    #[test]
    fn test_bytes_to_si() {
        assert_eq!(bytes_to_si(3 * 1024 * 1024 * 1024), "3Gi");
        assert_eq!(bytes_to_si(1536 * 1024 * 1024), "1.5Gi");
        assert_eq!(bytes_to_si(100), "100");
    }

    #[test]
    fn test_cpu_to_cores() {
        assert_eq!(cpu_to_cores("500m").unwrap(), 0.5);
        assert_eq!(cpu_to_cores("1.25").unwrap(), 1.25);
        assert_eq!(cpu_to_cores("4").unwrap(), 4.0);
        assert!(cpu_to_cores("1.2345").is_err());
        assert!(cpu_to_cores("500n").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("4w").unwrap(), Duration::from_secs(4 * 604_800));
        assert!(parse_duration("five minutes").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
    }
}
