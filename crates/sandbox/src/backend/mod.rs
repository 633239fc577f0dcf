use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// How a check command is isolated from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Spawn the shell directly with the worker's signal state.
    Direct,
    /// Spawn the shell with inherited signal dispositions and mask cleared.
    ProcessGroup,
}

impl ExecMode {
    pub fn from_fork_on_exec(enabled: bool) -> Self {
        if enabled {
            ExecMode::ProcessGroup
        } else {
            ExecMode::Direct
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Direct => "direct",
            ExecMode::ProcessGroup => "process-group",
        }
    }
}

/// `/bin/sh -c <command_line>` with stdout piped back to the worker.
pub(crate) fn build_command(command_line: &str, mode: ExecMode) -> Command {
    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // Both modes lead their own group so a timeout reaches grandchildren.
    unix::isolate_in_group(&mut command, mode == ExecMode::ProcessGroup);
    command
}

/// Interrupt, wait `grace`, then kill unconditionally.
pub(crate) async fn escalate_kill(pid: u32, mode: ExecMode, grace: Duration) {
    unix::interrupt(pid, mode);
    tokio::time::sleep(grace).await;
    unix::kill(pid, mode);
}

pub(crate) mod unix;
