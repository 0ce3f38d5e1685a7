// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Subprocess plugin runner: one process per command, request JSON on
//! stdin, response JSON on stdout, structured errors on stderr.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as ProcessCommand;

use super::proto::{Request, Response};
use super::{PluginError, PluginResult, Runner};

/// The structured error a plugin may print to stderr before exiting
/// non-zero.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginErrorOutput {
    #[serde(default)]
    error_code: String,

    #[serde(default)]
    error_message: String,
}

/// Runs a plugin executable. The command name is passed as the single
/// argument; the process is reaped on every path, including cancellation.
pub struct PluginProcessRunner {
    path: PathBuf,
}

impl PluginProcessRunner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Runner for PluginProcessRunner {
    async fn run(&self, request: &Request) -> PluginResult<Response> {
        let command = request.command();
        let input = request.to_json()?;
        debug!(
            "invoking plugin {:?} command {command} ({} request bytes)",
            self.path,
            input.len()
        );

        let io_err = |source| PluginError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let mut child = ProcessCommand::new(&self.path)
            .arg(command.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_err)?;

        // stdin is piped above, so take() cannot miss.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await.map_err(io_err)?;
        }

        let output = child.wait_with_output().await.map_err(io_err)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = match serde_json::from_str::<PluginErrorOutput>(&stderr) {
                Ok(structured) if !structured.error_message.is_empty() => {
                    format!("{}: {}", structured.error_code, structured.error_message)
                }
                _ => stderr,
            };
            return Err(PluginError::Failed {
                path: self.path.display().to_string(),
                status: output.status.to_string(),
                stderr: message,
            });
        }

        Response::from_json(command, &output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::proto::GetMetadataRequest;
    use crate::plugin::CONTRACT_VERSION;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    fn write_plugin(dir: &tempfile::TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("notation-test-plugin");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn metadata_request() -> Request {
        Request::GetMetadata(GetMetadataRequest {
            contract_version: CONTRACT_VERSION.to_string(),
            plugin_config: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn runs_plugin_and_parses_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            &dir,
            r##"#!/bin/sh
case "$1" in
get-plugin-metadata)
    echo '{"name":"com.example.plugin","version":"1.0.0","supportedContractVersions":["1"],"capabilities":["SIGNATURE_GENERATOR.RAW"]}'
    ;;
*)
    echo '{"errorCode":"UNSUPPORTED","errorMessage":"unknown command"}' >&2
    exit 1
    ;;
esac
"##,
        );

        let runner = PluginProcessRunner::new(path);
        let metadata = runner
            .run(&metadata_request())
            .await
            .unwrap()
            .into_metadata()
            .unwrap();
        assert_eq!(metadata.name, "com.example.plugin");
        metadata.validate().unwrap();
    }

    #[tokio::test]
    async fn surfaces_structured_stderr_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            &dir,
            r##"#!/bin/sh
echo '{"errorCode":"ACCESS_DENIED","errorMessage":"key is locked"}' >&2
exit 3
"##,
        );

        let runner = PluginProcessRunner::new(path);
        let err = runner.run(&metadata_request()).await.unwrap_err();
        match err {
            PluginError::Failed { stderr, .. } => {
                assert!(stderr.contains("ACCESS_DENIED"), "{stderr}");
                assert!(stderr.contains("key is locked"), "{stderr}");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_stdout_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(&dir, "#!/bin/sh\necho 'not json'\n");

        let runner = PluginProcessRunner::new(path);
        assert!(matches!(
            runner.run(&metadata_request()).await.unwrap_err(),
            PluginError::Protocol { .. }
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let runner = PluginProcessRunner::new("/nonexistent/notation-plugin");
        assert!(matches!(
            runner.run(&metadata_request()).await.unwrap_err(),
            PluginError::Io { .. }
        ));
    }
}
