// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

fn main() {
    // Tracing setup happens inside the library: as PID 1 there is no
    // /dev/kmsg until the trampoline has mounted /dev itself.
    if let Err(e) = multirom_lib::cli::run_trampoline_from_iter(std::env::args_os()) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
