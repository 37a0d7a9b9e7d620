//! The `hps-conditions` command-line tool.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    hps_conditions::cli::cli()
}
