use std::process::ExitCode;

fn main() -> ExitCode {
    plenum::cli::main()
}
