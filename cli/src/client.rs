//! Connection helpers shared by the `config` and `query` subcommands.

use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use swconf_core::client::Client;
use swconf_core::protocol::{Request, Response};
use swconf_core::rundir::RunDir;


pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);


/// Connect to `target`, or to the only running leader when none is named.
pub fn connect(run_dir: &RunDir, target: Option<&str>, timeout: Option<Duration>) -> Result<Client> {
    let target = match target {
        Some(t) => t.to_string(),
        None => match run_dir.live_leaders().as_slice() {
            [pid] => pid.to_string(),
            [] => bail!("no leader is running under {}", run_dir.root().display()),
            _ => bail!("several leaders are running; name one"),
        },
    };
    Client::connect_target(run_dir, &target, timeout)
        .with_context(|| format!("cannot reach leader '{}'", target))
}


/// Send one request and print its outcome: the value on stdout when ok,
/// the status verbatim on stderr otherwise.
pub fn one_shot(client: &mut Client, req: Request) -> Result<ExitCode> {
    let resp = client.request(req)?;
    Ok(report(&resp))
}


pub fn report(resp: &Response) -> ExitCode {
    if !resp.is_ok() {
        eprintln!("{}", resp.status);
        return ExitCode::FAILURE;
    }
    if let Some(value) = &resp.value {
        print_value(value);
    }
    ExitCode::SUCCESS
}


/// Print a value, adding a newline only when it lacks one.
pub fn print_value(value: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(value.as_bytes());
    if !value.ends_with('\n') {
        let _ = out.write_all(b"\n");
    }
}
