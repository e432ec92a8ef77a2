use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use fabric_core::tokio::{self, task::JoinHandle};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// the api and the reconciler must both survive the stabilization window
pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    reconciler_task: &mut JoinHandle<()>,
) -> Result<()> {
    verify_background_task_running("external API", api_task)
        .await
        .context("startup check failed")?;
    verify_background_task_running("reconciler", reconciler_task)
        .await
        .context("startup check failed")?;
    Ok(())
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_running_task_passes() {
        let mut task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        assert!(verify_background_task_running("sleeper", &mut task).await.is_ok());
        task.abort();
    }

    #[tokio::test]
    async fn test_exited_task_fails() {
        let mut task = tokio::spawn(async {});
        let err = verify_background_task_running("quitter", &mut task)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quitter exited"));
    }

    #[tokio::test]
    async fn test_panicked_task_fails() {
        let mut task = tokio::spawn(async { panic!("boom") });
        let err = verify_background_task_running("panicker", &mut task)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }
}
