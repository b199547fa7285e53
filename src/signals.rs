use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::process::ExitCode;

pub fn write_pid_file() -> std::io::Result<()> {
    std::fs::write(
        &crate::cli::get_cli_args().pid_file,
        std::process::id().to_string(),
    )
}

pub fn remove_pid_file() {
    let _ = std::fs::remove_file(&crate::cli::get_cli_args().pid_file);
}

/// `berth stop`: signal the daemon named by the pid file.
pub fn send_stop() -> ExitCode {
    let pid_file = &crate::cli::get_cli_args().pid_file;

    let pid = match std::fs::read_to_string(pid_file) {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("Unable to read pid file: {err}");
            return ExitCode::FAILURE;
        }
    };

    let pid: i32 = match pid.trim().parse() {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("Unable to parse pid: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGINT,
    ) {
        eprintln!("Unable to send signal: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// SIGINT/SIGTERM trigger one graceful-shutdown notification. The sweep
/// itself runs on the main task after the server drains.
pub fn handle_shutdown(tx: tokio::sync::mpsc::Sender<()>) {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).expect("No signals :(. This really should never happen");

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let _ = tx.blocking_send(());
        }
    });
}
