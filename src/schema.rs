//! Detecting the daemon's protocol schema version.
//!
//! `<executable> editor-info` prints a JSON object such as
//! `{"schemaVersion": 5, "cliVersion": "0.45.0", "plugins": [...]}`; only
//! `schemaVersion` is used here.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::models::ProtocolVersion;

const OLDEST_SUPPORTED: u32 = 4;
const NEWEST_SUPPORTED: u32 = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditorInfo {
    schema_version: u32,
}

/// Run `editor-info` and return the advertised schema version.
///
/// # Errors
///
/// `Configuration` when the executable is missing, exits unsuccessfully or
/// prints something other than the expected JSON; `Timeout` when it does
/// not finish in time.
pub async fn detect_schema_version(
    executable: &Path,
    working_dir: Option<&Path>,
    timeout: Duration,
) -> Result<u32, ServiceError> {
    let mut cmd = Command::new(executable);
    cmd.arg("editor-info")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| ServiceError::timeout("editor-info", timeout))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ServiceError::Configuration(format!(
                "dprint executable not found: {}",
                executable.display()
            )),
            _ => ServiceError::Configuration(format!("Failed to run dprint editor-info: {}", e)),
        })?;

    if !output.status.success() {
        return Err(ServiceError::Configuration(format!(
            "dprint editor-info exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = parse_editor_info(&stdout)?;
    debug!("dprint reports schema version {}", version);
    Ok(version)
}

/// Extract `schemaVersion` from `editor-info` output.
pub fn parse_editor_info(stdout: &str) -> Result<u32, ServiceError> {
    serde_json::from_str::<EditorInfo>(stdout.trim())
        .map(|info| info.schema_version)
        .map_err(|e| {
            ServiceError::Configuration(format!("Failed to parse dprint editor-info output: {}", e))
        })
}

/// Pick the protocol implementation for a schema version.
pub fn select_protocol(schema_version: u32) -> Result<ProtocolVersion, ServiceError> {
    match schema_version {
        4 => Ok(ProtocolVersion::V4),
        5 => Ok(ProtocolVersion::V5),
        v if v < OLDEST_SUPPORTED => {
            warn!("dprint schema version {} is older than supported", v);
            Err(ServiceError::Configuration(format!(
                "dprint schema version {} is too old, please update dprint (minimum schema {})",
                v, OLDEST_SUPPORTED
            )))
        }
        v => {
            warn!("dprint schema version {} is newer than supported", v);
            Err(ServiceError::Configuration(format!(
                "dprint schema version {} is not supported yet (maximum schema {})",
                v, NEWEST_SUPPORTED
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_editor_info() {
        let output = r#"{"schemaVersion":5,"cliVersion":"0.45.0","plugins":[]}"#;
        assert_eq!(parse_editor_info(output).unwrap(), 5);
        assert_eq!(parse_editor_info("  {\"schemaVersion\": 4}\n").unwrap(), 4);
    }

    #[test]
    fn test_parse_editor_info_rejects_garbage() {
        for output in ["", "not json", r#"{"cliVersion":"0.45.0"}"#, r#"{"schemaVersion":"5"}"#] {
            let err = parse_editor_info(output).unwrap_err();
            assert!(matches!(err, ServiceError::Configuration(_)), "{}", output);
        }
    }

    #[test]
    fn test_select_protocol() {
        assert_eq!(select_protocol(4).unwrap(), ProtocolVersion::V4);
        assert_eq!(select_protocol(5).unwrap(), ProtocolVersion::V5);

        let older = select_protocol(3).unwrap_err().to_string();
        assert!(older.contains("too old"), "{}", older);

        let newer = select_protocol(6).unwrap_err().to_string();
        assert!(newer.contains("not supported yet"), "{}", newer);
    }

    #[tokio::test]
    async fn test_detect_missing_executable() {
        let err = detect_schema_version(
            Path::new("/definitely/not/dprint"),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not found"), "{}", err);
    }

    /// `sh editor-info` runs the script named `editor-info` in the
    /// working directory, standing in for the real subcommand.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_schema_version_from_process_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("editor-info"),
            "echo '{\"schemaVersion\":5,\"plugins\":[]}'\n",
        )
        .unwrap();

        let version = detect_schema_version(Path::new("sh"), Some(dir.path()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(version, 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_reports_failed_process() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("editor-info"), "echo broken >&2\nexit 3\n").unwrap();

        let err = detect_schema_version(Path::new("sh"), Some(dir.path()), Duration::from_secs(5))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited with"), "{}", message);
        assert!(message.contains("broken"), "{}", message);
    }
}
