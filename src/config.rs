use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub storage_root: PathBuf,
    pub work_dir: PathBuf,
    pub worker_program: String,
    pub worker_leading_args: Vec<String>,
    pub job_timeout: Duration,
    pub retention: Duration,
    pub max_records_limit: u32,
    pub default_max_records: u32,
    pub max_concurrent_jobs: usize,
    pub max_upload_bytes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw = env::var("EXTRACT_RELAY_BIND_ADDR").ok().map(|raw| {
            raw.trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string()
        });
        let bind_addr = parse_value::<SocketAddr>("EXTRACT_RELAY_BIND_ADDR", bind_raw)?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let storage_root = PathBuf::from(
            env::var("EXTRACT_RELAY_STORAGE_ROOT").unwrap_or_else(|_| "/data/artifacts".to_string()),
        );

        let work_dir = env::var("EXTRACT_RELAY_WORK_DIR")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        let worker_command = env::var("EXTRACT_RELAY_WORKER_COMMAND")
            .unwrap_or_else(|_| "parser-2gis".to_string());
        let (worker_program, worker_leading_args) = split_worker_command(&worker_command)
            .context("EXTRACT_RELAY_WORKER_COMMAND must name a program")?;

        let job_timeout_seconds = parse_var::<u64>("EXTRACT_RELAY_JOB_TIMEOUT_SECONDS")?
            .unwrap_or(300)
            .max(1);

        let retention_seconds = parse_var::<u64>("EXTRACT_RELAY_RETENTION_SECONDS")?
            .unwrap_or(24 * 60 * 60)
            .max(1);

        let max_records_limit = parse_var::<u32>("EXTRACT_RELAY_MAX_RECORDS_LIMIT")?
            .unwrap_or(10_000)
            .max(1);

        let default_max_records = parse_var::<u32>("EXTRACT_RELAY_DEFAULT_MAX_RECORDS")?
            .unwrap_or(100)
            .clamp(1, max_records_limit);

        let max_concurrent_jobs = parse_var::<usize>("EXTRACT_RELAY_MAX_CONCURRENT_JOBS")?
            .unwrap_or(4)
            .max(1);

        let max_upload_bytes = parse_var::<u64>("EXTRACT_RELAY_MAX_UPLOAD_BYTES")?
            .unwrap_or(100 * 1024 * 1024)
            .max(1);

        Ok(Self {
            bind_addr,
            storage_root,
            work_dir,
            worker_program,
            worker_leading_args,
            job_timeout: Duration::from_secs(job_timeout_seconds),
            retention: Duration::from_secs(retention_seconds),
            max_records_limit,
            default_max_records,
            max_concurrent_jobs,
            max_upload_bytes,
        })
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_value(name, env::var(name).ok())
}

/// Unset or blank means "use the default"; anything else must parse.
fn parse_value<T>(name: &str, raw: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .with_context(|| format!("{name} has an invalid value `{raw}`"))
}

fn split_worker_command(raw: &str) -> Option<(String, Vec<String>)> {
    let mut parts = raw.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{parse_value, split_worker_command};

    #[test]
    fn worker_command_keeps_leading_args() {
        let (program, args) = split_worker_command("python  parser-2gis").expect("program");
        assert_eq!(program, "python");
        assert_eq!(args, vec!["parser-2gis".to_string()]);
    }

    #[test]
    fn malformed_value_names_the_variable() {
        let err = parse_value::<u64>("EXTRACT_RELAY_JOB_TIMEOUT_SECONDS", Some("5m".to_string()))
            .expect_err("malformed");
        assert!(err.to_string().contains("EXTRACT_RELAY_JOB_TIMEOUT_SECONDS"));

        assert!(parse_value::<SocketAddr>("EXTRACT_RELAY_BIND_ADDR", Some("nope:80".to_string()))
            .is_err());
    }

    #[test]
    fn unset_or_blank_value_uses_default() {
        assert_eq!(parse_value::<u32>("EXTRACT_RELAY_MAX_RECORDS_LIMIT", None).expect("unset"), None);
        assert_eq!(
            parse_value::<u32>("EXTRACT_RELAY_MAX_RECORDS_LIMIT", Some("  ".to_string())).expect("blank"),
            None
        );
        assert_eq!(
            parse_value::<u32>("EXTRACT_RELAY_MAX_RECORDS_LIMIT", Some(" 250 ".to_string())).expect("set"),
            Some(250)
        );
    }

    #[test]
    fn blank_worker_command_is_rejected() {
        assert!(split_worker_command("   ").is_none());
    }
}
