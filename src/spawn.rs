//! OS process spawning with per-job log capture.
//!
//! The child's stdout is redirected to the job's log file and stderr is
//! inherited. Environment additions and the working directory are applied
//! per child through `Command`, so concurrent jobs never observe each
//! other's settings. Command lines are printed under a process-wide mutex
//! to keep the build log cleanly interleaved.

use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::Mutex;

pub use crate::compile::Invocation;

static CONSOLE: Mutex<()> = Mutex::new(());

/// Spawn the invocation and wait for it. Returns `true` iff the child
/// exited with status zero.
pub fn spawn_and_wait(invocation: &Invocation) -> bool {
    if std::env::var_os("MINICARGO_DUMPENV").is_some() {
        let _lock = CONSOLE.lock().unwrap();
        let mut line = String::new();
        for (key, value) in &invocation.env {
            line.push_str(key);
            line.push('=');
            line.push_str(&value.to_string_lossy());
            line.push(' ');
        }
        println!("{line}");
    }

    if let Some(dir) = &invocation.ensure_dir {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Some(parent) = invocation.logfile.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    {
        let _lock = CONSOLE.lock().unwrap();
        let mut line = format!("> {}", invocation.program.display());
        for arg in &invocation.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        println!("{line}");
    }

    let logfile = match File::create(&invocation.logfile) {
        Ok(f) => f,
        Err(e) => {
            let _lock = CONSOLE.lock().unwrap();
            print_red(&format!(
                "Unable to create log file '{}' - {e}",
                invocation.logfile.display()
            ));
            return false;
        }
    };

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(logfile));
    for (key, value) in &invocation.env {
        command.env(key, value);
    }
    if let Some(cwd) = &invocation.cwd {
        command.current_dir(cwd);
    }

    let status = match command.status() {
        Ok(status) => status,
        Err(e) => {
            let _lock = CONSOLE.lock().unwrap();
            print_red(&format!(
                "Unable to run process '{}' - {e}",
                invocation.program.display()
            ));
            run_once_check(false);
            return false;
        }
    };

    let ok = status.success();
    if !ok {
        let _lock = CONSOLE.lock().unwrap();
        print_red(&describe_failure(status));
        let mut line = String::from("FAILING COMMAND: ");
        line.push_str(&invocation.program.to_string_lossy());
        for arg in &invocation.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        eprintln!("{line}");
    }
    run_once_check(ok);
    ok
}

fn describe_failure(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Process exited with non-zero exit status {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Process was terminated with signal {signal}");
        }
    }
    format!("Process terminated for unknown reason, status={status}")
}

fn print_red(message: &str) {
    eprintln!("\x1b[31m{message}\x1b[0m");
}

/// Diagnostic aid: abort the whole driver after the first spawn.
fn run_once_check(ok: bool) {
    if std::env::var_os("MINICARGO_RUN_ONCE").is_some()
        || std::env::var_os("MINICARGO_RUNONCE").is_some()
    {
        if ok {
            eprintln!("- Only running compiler once");
        }
        std::process::exit(1);
    }
}
