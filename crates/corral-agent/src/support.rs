pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_f64(name: &str) -> Option<f64> {
    env_string(name)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    match env_string(name)?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
pub(crate) fn temp_dir_for(test_name: &str) -> std::path::PathBuf {
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::{SystemTime, UNIX_EPOCH},
    };

    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "corral-agent-{test_name}-{}-{n}-{ts}",
        std::process::id()
    ));
    dir
}

#[cfg(test)]
mod tests {
    use super::format_error_chain;
    use anyhow::Context;

    #[test]
    fn error_chain_joins_causes() {
        let err = Err::<(), _>(std::io::Error::other("disk full"))
            .context("copy global overlay")
            .unwrap_err();
        assert_eq!(format_error_chain(&err), "copy global overlay: disk full");
    }

    #[test]
    fn error_chain_skips_repeated_messages() {
        let err = anyhow::anyhow!("boom").context("boom");
        assert_eq!(format_error_chain(&err), "boom");
    }
}
