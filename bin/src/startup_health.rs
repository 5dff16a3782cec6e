use std::time::Duration;

use anyhow::{Result, anyhow};
use burrow_core::{
    router::RouterState,
    tokio::{self, task::JoinHandle},
};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

pub fn verify_registry_connected(state: RouterState) -> Result<()> {
    match state {
        RouterState::Connected => Ok(()),
        state => Err(anyhow!("registry not connected after start-up: {state:?}")),
    }
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
