use std::path::Path;

use anyhow::{Context, Result};

/// Print the last `n` lines of the spawner log, or of the server log for `port`.
pub fn tail_logs(port: Option<u16>, n: usize) -> Result<()> {
    let log_path = match port {
        Some(port) => crate::config::server_log_path(port)?,
        None => crate::config::spawner_log_path()?,
    };

    if !log_path.exists() {
        println!("No logs found at {}", log_path.display());
        return Ok(());
    }

    for line in last_lines(&log_path, n)? {
        println!("{}", line);
    }
    Ok(())
}

fn last_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let content = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let content = String::from_utf8_lossy(&content);

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_lines() {
        let path = std::env::temp_dir().join(format!("termbridge-logs-{}.log", std::process::id()));
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        assert_eq!(last_lines(&path, 2).unwrap(), vec!["two", "three"]);
        assert_eq!(last_lines(&path, 10).unwrap().len(), 3);

        std::fs::remove_file(&path).unwrap();
    }
}
