use std::process::ExitCode;

use anyhow::Result;

fn main() -> Result<ExitCode> {
    pagesweep::cli::run()
}
