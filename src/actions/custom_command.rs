// src/actions/custom_command.rs

//! Custom-command action
//!
//! Runs a user-defined command via `bash -ec` in the action's working
//! directory with the output logged to `the.log`.

use crate::actions::meta::settings;
use crate::actions::process::BuildProcess;
use crate::actions::{ActionHandle, ServiceSetup};
use std::sync::Arc;
use tokio::process::Command;

pub async fn run(setup: &Arc<ServiceSetup>, action: &Arc<ActionHandle>) {
    let (directory, command_setting) = {
        let data = action.lock();
        (
            data.directory.clone(),
            data.settings.get(settings::COMMAND).cloned(),
        )
    };
    if directory.is_empty() {
        action.report_error(setup, "No directory specified.").await;
        return;
    }
    let Some(command_line) = command_setting.filter(|cmd| !cmd.is_empty()) else {
        action.report_error(setup, "No command specified.").await;
        return;
    };

    let working_directory = setup
        .building
        .read()
        .await
        .custom_command_dir()
        .join(&directory);
    if let Err(e) = tokio::fs::create_dir_all(&working_directory).await {
        action
            .report_error(setup, format!("Unable to create working directory: {}", e))
            .await;
        return;
    }

    action.append_output(format!("Running custom command: {}\n", command_line));

    let mut command = Command::new("bash");
    command
        .arg("-ec")
        .arg(&command_line)
        .current_dir(&working_directory);
    let process = BuildProcess::new("command", working_directory.join("the.log"));
    let result = process.run(action, command).await;

    if !result.error.is_empty() {
        action.append_output(format!("Unable to invoke command: {}\n", result.error));
        action.report_error(setup, result.error.clone()).await;
        return;
    }
    action.append_output(format!(
        "Command exited with return code {}\n",
        result
            .exit_code
            .map_or_else(|| "?".to_string(), |code| code.to_string())
    ));
    match result.exit_code {
        Some(0) => action.report_success(setup).await,
        Some(code) => {
            action
                .report_error(setup, format!("non-zero exit code {}", code))
                .await
        }
        None => {
            action
                .report_error(setup, "command terminated by signal")
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{
        BuildActionResult, BuildActionResultData, BuildActionType, BuildingConfig,
    };
    use crate::config::Config;

    async fn setup_in(dir: &std::path::Path) -> Arc<ServiceSetup> {
        let building = BuildingConfig {
            working_directory: dir.join("building"),
            ..Default::default()
        };
        ServiceSetup::new(Config::new(), building)
    }

    #[tokio::test]
    async fn test_custom_command_success_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup_in(dir.path()).await;
        let action = setup.create_action(BuildActionType::CustomCommand).await;
        {
            let mut data = action.lock();
            data.directory = "my-command".to_string();
            data.settings
                .insert(settings::COMMAND.to_string(), "echo hello".to_string());
        }
        action.clone().start(&setup).await;

        assert_eq!(action.lock().result, BuildActionResult::Success);
        let log = std::fs::read_to_string(
            dir.path().join("building/custom-commands/my-command/the.log"),
        )
        .unwrap();
        assert_eq!(log, "hello\n");
    }

    #[tokio::test]
    async fn test_custom_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup_in(dir.path()).await;
        let action = setup.create_action(BuildActionType::CustomCommand).await;
        {
            let mut data = action.lock();
            data.directory = "failing".to_string();
            data.settings
                .insert(settings::COMMAND.to_string(), "exit 7".to_string());
        }
        action.clone().start(&setup).await;

        let data = action.lock();
        assert_eq!(data.result, BuildActionResult::Failure);
        match &data.result_data {
            BuildActionResultData::Error(message) => {
                assert!(message.contains("non-zero exit code 7"))
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_custom_command_requires_command_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup_in(dir.path()).await;

        let action = setup.create_action(BuildActionType::CustomCommand).await;
        action.lock().directory = "has-dir".to_string();
        action.clone().start(&setup).await;
        let guard = action.lock();
        match &guard.result_data {
            BuildActionResultData::Error(message) => assert!(message.contains("No command")),
            other => panic!("expected error, got {:?}", other),
        }
        drop(guard);

        let action = setup.create_action(BuildActionType::CustomCommand).await;
        action
            .lock()
            .settings
            .insert(settings::COMMAND.to_string(), "true".to_string());
        action.clone().start(&setup).await;
        let guard = action.lock();
        match &guard.result_data {
            BuildActionResultData::Error(message) => assert!(message.contains("No directory")),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
