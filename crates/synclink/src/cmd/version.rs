use synclink_transport::{DEFAULT_CONTROL_PORT, LEGACY_CONTROL_PORT};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("synclink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: synclink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("SYNCLINK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("control_port: {DEFAULT_CONTROL_PORT} (legacy {LEGACY_CONTROL_PORT})");
    println!("features: device={}, cli=true", cfg!(feature = "device"));

    Ok(SUCCESS)
}
