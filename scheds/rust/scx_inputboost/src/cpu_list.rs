// SPDX-License-Identifier: GPL-2.0
use std::collections::HashSet;

/// Upper bound on CPU ids accepted from the command line or sysfs.
pub const MAX_CPUS: usize = 8192;

/// Parses the kernel's CPU list syntax, e.g. `0-3,6`. Tokens may also be
/// separated by whitespace, which covers `related_cpus`-style lists.
pub fn parse_cpu_list(optarg: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    let mut seen = HashSet::new();

    if optarg
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err("Invalid character in CPU list".to_string());
    }

    for token in optarg.split(|c: char| c == ',' || c.is_whitespace()) {
        let token = token.trim();
        if token.is_empty() { continue; }

        if let Some((start_str, end_str)) = token.split_once('-') {
            let start = start_str.trim().parse::<usize>().map_err(|_| "Invalid range start")?;
            let end = end_str.trim().parse::<usize>().map_err(|_| "Invalid range end")?;
            if start > end { return Err(format!("Invalid CPU range: {}-{}", start, end)); }
            if end >= MAX_CPUS {
                return Err(format!("CPU {} out of range (max {})", end, MAX_CPUS - 1));
            }
            for i in start..=end {
                if seen.insert(i) { cpus.push(i); }
            }
        } else {
            let cpu = token.parse::<usize>().map_err(|_| format!("Invalid CPU: {}", token))?;
            if cpu >= MAX_CPUS {
                return Err(format!("CPU {} out of range (max {})", cpu, MAX_CPUS - 1));
            }
            if seen.insert(cpu) { cpus.push(cpu); }
        }
    }

    Ok(cpus)
}

/// Formats CPUs back into compact list syntax for logging.
pub fn format_cpu_list(cpus: &[usize]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().unwrap_or(end);
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_cpu() {
        let v = parse_cpu_list("3").unwrap();
        assert_eq!(v, vec![3]);
    }

    #[test]
    fn parses_range_and_single() {
        let mut v = parse_cpu_list("0-2,5").unwrap();
        v.sort();
        assert_eq!(v, vec![0,1,2,5]);
    }

    #[test]
    fn parses_space_separated_sysfs_list() {
        assert_eq!(parse_cpu_list("4 5 6 7\n").unwrap(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn rejects_bad_chars() {
        assert!(parse_cpu_list("0-2,a").is_err());
    }

    #[test]
    fn rejects_reversed_range() {
        assert!(parse_cpu_list("3-1").is_err());
    }

    #[test]
    fn formats_ranges() {
        assert_eq!(format_cpu_list(&[6, 0, 1, 2, 3]), "0-3,6");
        assert_eq!(format_cpu_list(&[]), "");
    }
}
