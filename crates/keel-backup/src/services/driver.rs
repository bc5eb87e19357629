//! Dump and restore subprocess construction.
//!
//! Selects the client tool for an engine, resolves its binary from
//! versioned install roots before generic ones and PATH, and builds the
//! per-engine argument profiles for streaming dumps, staged dumps and
//! restores.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::services::error::BackupError;
use crate::services::registry::ResolvedConnection;

pub fn required_tool(engine: &str) -> Option<&'static str> {
    match engine {
        "postgresql" => Some("pg_dump"),
        "mysql" | "mariadb" => Some("mysqldump"),
        "mongodb" => Some("mongodump"),
        "redis" => Some("redis-cli"),
        _ => None,
    }
}

pub fn verify_backup_tools(engine: &str) -> Result<&'static str, BackupError> {
    required_tool(engine)
        .ok_or_else(|| BackupError::Unsupported(format!("unsupported database type: {}", engine)))
}

/// Engines whose dump tool can write to stdout.
pub fn is_streamable(engine: &str) -> bool {
    matches!(engine, "postgresql" | "mysql" | "mariadb")
}

#[cfg(target_os = "linux")]
const BINARY_ROOTS: &[&str] = &[
    "/usr/bin",
    "/usr/local/bin",
    "/opt/postgresql*/bin",
    "/opt/mysql*/bin",
];

#[cfg(target_os = "macos")]
const BINARY_ROOTS: &[&str] = &[
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/opt/homebrew/opt/postgresql@*/bin",
    "/opt/homebrew/opt/mysql@*/bin",
    "/usr/local/opt/postgresql@*/bin",
    "/usr/local/opt/mysql@*/bin",
];

#[cfg(target_os = "windows")]
const BINARY_ROOTS: &[&str] = &[
    "C:\\Program Files\\PostgreSQL\\*\\bin",
    "C:\\Program Files\\MySQL\\*\\bin",
    "C:\\Program Files\\MariaDB*\\bin",
    "C:\\Program Files\\MongoDB\\*\\bin",
];

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const BINARY_ROOTS: &[&str] = &["/usr/bin", "/usr/local/bin"];

fn platform_executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

/// Resolves the absolute path of a client tool.
///
/// Versioned install roots (patterns with a wildcard) are searched first,
/// newest version first, then generic roots, then the process PATH.
pub fn find_binary(tool: &str) -> Option<PathBuf> {
    let exec_name = platform_executable_name(tool);

    let (versioned, generic): (Vec<&str>, Vec<&str>) =
        BINARY_ROOTS.iter().partition(|p| p.contains('*'));

    for pattern in versioned {
        let mut matches: Vec<PathBuf> = glob::glob(pattern)
            .map(|paths| paths.flatten().collect())
            .unwrap_or_default();
        sort_paths_by_version_desc(&mut matches);
        for dir in matches {
            let candidate = dir.join(&exec_name);
            if candidate.is_file() {
                debug!("resolved {} at {}", tool, candidate.display());
                return Some(candidate);
            }
        }
    }

    for dir in generic {
        let candidate = Path::new(dir).join(&exec_name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    // PATH as last resort
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(&exec_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    None
}

pub fn find_required_binary(engine: &str, tool: &str) -> Result<PathBuf, BackupError> {
    find_binary(tool).ok_or_else(|| BackupError::ToolMissing {
        engine: engine.to_string(),
        tool: tool.to_string(),
    })
}

/// Orders versioned install directories newest-first, e.g.
/// `postgresql@16` before `postgresql@14`.
fn sort_paths_by_version_desc(paths: &mut [PathBuf]) {
    paths.sort_by_key(|p| std::cmp::Reverse(extract_path_version(p)));
}

fn extract_path_version(path: &Path) -> u32 {
    let text = path.to_string_lossy();
    let tail = match text.rsplit_once('@') {
        Some((_, tail)) => tail.to_string(),
        None => text.to_string(),
    };
    tail.split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// A ready-to-spawn dump subprocess description.
pub struct DumpCommand {
    pub command: Command,
    /// True when the tool writes to a local path instead of stdout.
    pub file_mode: bool,
}

/// Builds the streaming dump command (stdout carries the dump bytes).
/// Only valid for streamable engines.
pub fn streaming_dump_command(conn: &ResolvedConnection) -> Result<Command, BackupError> {
    match conn.engine.as_str() {
        "postgresql" => {
            let bin = find_required_binary("postgresql", "pg_dump")?;
            let mut cmd = Command::new(bin);
            // Plain format: the only pg_dump format that supports stdout
            cmd.arg("-h")
                .arg(&conn.host)
                .arg("-p")
                .arg(conn.port.to_string())
                .arg("-U")
                .arg(&conn.username)
                .arg("-d")
                .arg(&conn.database_name)
                .arg("-F")
                .arg("p")
                .arg("--no-owner")
                .arg("--no-privileges")
                .arg("--verbose")
                .env("PGPASSWORD", &conn.password);
            Ok(cmd)
        }
        "mysql" | "mariadb" => Ok(mysqldump_command(conn, None)?),
        other => Err(BackupError::Unsupported(format!(
            "{} does not support stdout streaming",
            other
        ))),
    }
}

/// Builds the staged dump command writing to `output_path`.
pub fn file_dump_command(
    conn: &ResolvedConnection,
    output_path: &Path,
) -> Result<Command, BackupError> {
    match conn.engine.as_str() {
        "postgresql" => {
            let bin = find_required_binary("postgresql", "pg_dump")?;
            let mut cmd = Command::new(bin);
            // Custom format compresses internally and restores in parallel
            cmd.arg("-h")
                .arg(&conn.host)
                .arg("-p")
                .arg(conn.port.to_string())
                .arg("-U")
                .arg(&conn.username)
                .arg("-d")
                .arg(&conn.database_name)
                .arg("-F")
                .arg("c")
                .arg("-f")
                .arg(output_path)
                .arg("--no-owner")
                .arg("--no-privileges")
                .arg("--verbose")
                .env("PGPASSWORD", &conn.password);
            Ok(cmd)
        }
        "mysql" | "mariadb" => mysqldump_command(conn, Some(output_path)),
        "mongodb" => {
            let bin = find_required_binary("mongodb", "mongodump")?;
            let mut cmd = Command::new(bin);
            // --archive produces a single staging file the fan-out can
            // stat, upload and delete
            cmd.arg("--host")
                .arg(&conn.host)
                .arg("--port")
                .arg(conn.port.to_string())
                .arg("--db")
                .arg(&conn.database_name)
                .arg(format!("--archive={}", output_path.display()));
            if !conn.username.is_empty() {
                cmd.arg("--username").arg(&conn.username);
            }
            if !conn.password.is_empty() {
                cmd.arg("--password").arg(&conn.password);
            }
            Ok(cmd)
        }
        "redis" => {
            let bin = find_required_binary("redis", "redis-cli")?;
            let mut cmd = Command::new(bin);
            cmd.arg("-h").arg(&conn.host).arg("-p").arg(conn.port.to_string());
            if !conn.password.is_empty() {
                cmd.arg("-a").arg(&conn.password);
            }
            if !conn.database_name.is_empty() {
                cmd.arg("-n").arg(&conn.database_name);
            }
            cmd.arg("--rdb").arg(output_path);
            Ok(cmd)
        }
        other => Err(BackupError::Unsupported(format!(
            "unsupported database type: {}",
            other
        ))),
    }
}

fn mysqldump_command(
    conn: &ResolvedConnection,
    output_path: Option<&Path>,
) -> Result<Command, BackupError> {
    let bin = find_required_binary(&conn.engine, "mysqldump")?;
    let mut cmd = Command::new(bin);
    cmd.arg("-h")
        .arg(&conn.host)
        .arg("-P")
        .arg(conn.port.to_string())
        .arg("-u")
        .arg(&conn.username)
        .arg(format!("-p{}", conn.password))
        .arg("--single-transaction")
        .arg("--quick")
        .arg("--lock-tables=false")
        .arg("--routines")
        .arg("--triggers")
        .arg("--events")
        .arg(&conn.database_name);

    // Without -r mysqldump writes to stdout
    if let Some(path) = output_path {
        cmd.arg("-r").arg(path);
    }

    Ok(cmd)
}

/// Builds the restore command for a downloaded (and decompressed) dump.
///
/// The returned flag tells the caller to pipe the dump file into stdin.
pub fn restore_command(
    conn: &ResolvedConnection,
    input_path: &Path,
) -> Result<(Command, bool), BackupError> {
    match conn.engine.as_str() {
        "postgresql" => {
            // Staged dumps use pg_dump's custom format regardless of the
            // file name; the PGDMP magic tells them apart from plain SQL.
            if !is_pg_custom_format(input_path) {
                let bin = find_required_binary("postgresql", "psql")?;
                let mut cmd = Command::new(bin);
                cmd.arg("-h")
                    .arg(&conn.host)
                    .arg("-p")
                    .arg(conn.port.to_string())
                    .arg("-U")
                    .arg(&conn.username)
                    .arg("-d")
                    .arg(&conn.database_name)
                    .arg("-f")
                    .arg(input_path)
                    .env("PGPASSWORD", &conn.password);
                Ok((cmd, false))
            } else {
                let bin = find_required_binary("postgresql", "pg_restore")?;
                let mut cmd = Command::new(bin);
                cmd.arg("--clean")
                    .arg("--if-exists")
                    .arg("--no-owner")
                    .arg("-h")
                    .arg(&conn.host)
                    .arg("-p")
                    .arg(conn.port.to_string())
                    .arg("-U")
                    .arg(&conn.username)
                    .arg("-d")
                    .arg(&conn.database_name)
                    .arg(input_path)
                    .env("PGPASSWORD", &conn.password);
                Ok((cmd, false))
            }
        }
        "mysql" | "mariadb" => {
            let bin = find_required_binary(&conn.engine, "mysql")?;
            let mut cmd = Command::new(bin);
            cmd.arg("-h")
                .arg(&conn.host)
                .arg("-P")
                .arg(conn.port.to_string())
                .arg("-u")
                .arg(&conn.username)
                .arg(format!("-p{}", conn.password))
                .arg(&conn.database_name);
            Ok((cmd, true))
        }
        "mongodb" => {
            let bin = find_required_binary("mongodb", "mongorestore")?;
            let mut cmd = Command::new(bin);
            cmd.arg("--host")
                .arg(&conn.host)
                .arg("--port")
                .arg(conn.port.to_string())
                .arg("--db")
                .arg(&conn.database_name)
                .arg("--drop")
                .arg(format!("--archive={}", input_path.display()));
            if !conn.username.is_empty() {
                cmd.arg("--username").arg(&conn.username);
            }
            if !conn.password.is_empty() {
                cmd.arg("--password").arg(&conn.password);
            }
            Ok((cmd, false))
        }
        "redis" => Err(BackupError::Unsupported(
            "redis restore requires loading the RDB file on the server".to_string(),
        )),
        other => Err(BackupError::Unsupported(format!(
            "unsupported database type: {}",
            other
        ))),
    }
}

fn is_pg_custom_format(path: &Path) -> bool {
    use std::io::Read;

    let mut magic = [0u8; 5];
    match std::fs::File::open(path) {
        Ok(mut file) => file.read_exact(&mut magic).is_ok() && &magic == b"PGDMP",
        Err(_) => false,
    }
}

// ----- PostgreSQL probes -----

/// `pg_dump --version` output, e.g. "pg_dump (PostgreSQL) 16.4".
pub async fn pg_dump_client_version() -> Result<String, BackupError> {
    let bin = find_required_binary("postgresql", "pg_dump")?;
    let output = Command::new(bin)
        .arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(BackupError::SubprocessFailed(
            "failed to get pg_dump version".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn run_psql_scalar(
    conn: &ResolvedConnection,
    query: &str,
) -> Result<String, BackupError> {
    let bin = find_required_binary("postgresql", "psql")?;
    let output = Command::new(bin)
        .arg("-h")
        .arg(&conn.host)
        .arg("-p")
        .arg(conn.port.to_string())
        .arg("-U")
        .arg(&conn.username)
        .arg("-d")
        .arg(&conn.database_name)
        .arg("-t")
        .arg("-A")
        .arg("-c")
        .arg(query)
        .env("PGPASSWORD", &conn.password)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(BackupError::SubprocessFailed(format!(
            "psql probe failed with status {}",
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Server version reported by `SELECT version()`, reduced to the version
/// number when possible.
pub async fn postgres_server_version(
    conn: &ResolvedConnection,
) -> Result<String, BackupError> {
    let version = run_psql_scalar(conn, "SELECT version();").await?;
    if let Some(idx) = version.find("PostgreSQL") {
        let rest = &version[idx + "PostgreSQL".len()..];
        if let Some(number) = rest.split_whitespace().next() {
            return Ok(number.to_string());
        }
    }
    Ok(version)
}

/// Whether the timescaledb extension is installed in the target database.
pub async fn is_timescaledb_installed(conn: &ResolvedConnection) -> bool {
    match run_psql_scalar(
        conn,
        "SELECT EXISTS(SELECT 1 FROM pg_extension WHERE extname = 'timescaledb');",
    )
    .await
    {
        Ok(result) => matches!(result.as_str(), "t" | "true" | "1"),
        Err(_) => false,
    }
}

/// Extracts the major version from strings like "pg_dump (PostgreSQL) 16.4"
/// or "16.4".
pub fn extract_pg_major_version(version: &str) -> Option<String> {
    for part in version.split_whitespace() {
        if part.starts_with(|c: char| c.is_ascii_digit()) {
            let major: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !major.is_empty() {
                return Some(major);
            }
        }
    }
    None
}

/// Detects pg_dump's server-version-mismatch abort in captured stderr.
pub fn is_version_mismatch_error(lines: &[String]) -> bool {
    lines.iter().any(|line| {
        let lower = line.to_lowercase();
        lower.contains("server version mismatch")
            || lower.contains("aborting because of server version mismatch")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection(engine: &str) -> ResolvedConnection {
        ResolvedConnection {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            name: "pg prod".to_string(),
            engine: engine.to_string(),
            host: "db.internal".to_string(),
            port: 5432,
            username: "app".to_string(),
            password: "hunter2".to_string(),
            database_name: "shop".to_string(),
            ssh_enabled: false,
            ssh_host: None,
            ssh_port: None,
            ssh_username: None,
            ssh_password: None,
            ssh_private_key: None,
        }
    }

    #[test]
    fn tool_map_covers_every_engine() {
        assert_eq!(required_tool("postgresql"), Some("pg_dump"));
        assert_eq!(required_tool("mysql"), Some("mysqldump"));
        assert_eq!(required_tool("mariadb"), Some("mysqldump"));
        assert_eq!(required_tool("mongodb"), Some("mongodump"));
        assert_eq!(required_tool("redis"), Some("redis-cli"));
        assert_eq!(required_tool("oracle"), None);
        assert!(verify_backup_tools("oracle").is_err());
    }

    #[test]
    fn streamability_per_engine() {
        assert!(is_streamable("postgresql"));
        assert!(is_streamable("mysql"));
        assert!(is_streamable("mariadb"));
        assert!(!is_streamable("mongodb"));
        assert!(!is_streamable("redis"));
    }

    #[test]
    fn versioned_paths_sort_descending() {
        let mut paths = vec![
            PathBuf::from("/usr/local/opt/postgresql@14/bin"),
            PathBuf::from("/usr/local/opt/postgresql@16/bin"),
            PathBuf::from("/usr/local/opt/postgresql@9/bin"),
        ];
        sort_paths_by_version_desc(&mut paths);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/usr/local/opt/postgresql@16/bin"),
                PathBuf::from("/usr/local/opt/postgresql@14/bin"),
                PathBuf::from("/usr/local/opt/postgresql@9/bin"),
            ]
        );
    }

    #[test]
    fn pg_major_version_extraction() {
        assert_eq!(
            extract_pg_major_version("pg_dump (PostgreSQL) 16.4"),
            Some("16".to_string())
        );
        assert_eq!(extract_pg_major_version("16.4"), Some("16".to_string()));
        assert_eq!(
            extract_pg_major_version("PostgreSQL 14.11 on x86_64"),
            Some("14".to_string())
        );
        assert_eq!(extract_pg_major_version("no digits here"), None);
    }

    #[test]
    fn version_mismatch_detection_is_case_insensitive() {
        let lines = vec![
            "pg_dump: error: server version: 16.4".to_string(),
            "pg_dump: error: Aborting because of SERVER VERSION MISMATCH".to_string(),
        ];
        assert!(is_version_mismatch_error(&lines));
        assert!(!is_version_mismatch_error(&["all fine".to_string()]));
    }

    #[test]
    fn mysqldump_streams_without_output_file() {
        let conn = test_connection("mysql");
        // Only check argument construction when the tool is installed.
        if find_binary("mysqldump").is_none() {
            return;
        }
        let cmd = mysqldump_command(&conn, None).unwrap();
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"--single-transaction".to_string()));
        assert!(args.contains(&"--lock-tables=false".to_string()));
        assert!(!args.contains(&"-r".to_string()));
    }

    #[test]
    fn custom_format_detected_by_magic_not_extension() {
        let dir = tempfile::tempdir().unwrap();

        let custom = dir.path().join("staged.sql");
        std::fs::write(&custom, b"PGDMP\x01\x0e\x04").unwrap();
        assert!(is_pg_custom_format(&custom));

        let plain = dir.path().join("plain.sql");
        std::fs::write(&plain, b"CREATE TABLE t (id int);").unwrap();
        assert!(!is_pg_custom_format(&plain));

        assert!(!is_pg_custom_format(&dir.path().join("missing.sql")));
    }

    #[test]
    fn redis_restore_is_unsupported() {
        let conn = test_connection("redis");
        assert!(matches!(
            restore_command(&conn, Path::new("/tmp/x.rdb")),
            Err(BackupError::Unsupported(_))
        ));
    }
}
