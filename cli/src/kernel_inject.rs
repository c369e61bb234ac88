// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

fn run() -> Result<()> {
    multirom_utils::initialize_tracing("kernel_inject");
    multirom_lib::cli::run_kernel_inject_from_iter(std::env::args_os())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
