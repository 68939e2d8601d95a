use std::fs;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use sha3::{Digest, Keccak256};

use dredge::config::Config;
use dredge::mode::Mode;
use dredge::types;

// Hex characters, so 99 bytes of init code. Matches the device-side limit.
const MAX_INIT_CODE_HEX_CHARS: usize = 198;

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse();
    let mode = cfg.mode()?;

    let address_bytes = types::decode_hex(&cfg.address, "address")?;
    let address: [u8; 20] = address_bytes.as_slice().try_into().map_err(|_| {
        anyhow!(
            "address must be exactly 20 bytes, got {}",
            address_bytes.len()
        )
    })?;

    let init_code_hex = load_init_code(&cfg)?;
    let stripped = init_code_hex.strip_prefix("0x").unwrap_or(&init_code_hex);
    if stripped.len() > MAX_INIT_CODE_HEX_CHARS {
        bail!(
            "init code is {} hex characters, at most {MAX_INIT_CODE_HEX_CHARS} are supported",
            stripped.len()
        );
    }
    let init_code = types::decode_hex(&init_code_hex, "init code")?;
    let init_code_digest: [u8; 32] = Keccak256::digest(&init_code).into();

    search(&cfg, &mode, address, init_code_digest)
}

fn load_init_code(cfg: &Config) -> Result<String> {
    let raw = match &cfg.init_code_file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read init code from {}", path.display()))?,
        None => cfg.init_code.clone(),
    };
    Ok(raw.trim().to_string())
}

#[cfg(feature = "opencl")]
fn search(cfg: &Config, mode: &Mode, address: [u8; 20], init_code_digest: [u8; 32]) -> Result<()> {
    use dredge::compute::init_hash_expression;
    use dredge::compute::opencl;
    use dredge::dispatch::Dispatcher;

    let devices = opencl::enumerate_devices(&cfg.skip, cfg.no_cache)?;
    if devices.is_empty() {
        bail!("no usable OpenCL devices found");
    }

    let init_hash = init_hash_expression(&address, &init_code_digest);
    let bootstrap = opencl::Bootstrap::create(&devices, &init_hash, cfg.no_cache)?;

    let mut dispatcher = Dispatcher::new(cfg.worksize_max(), cfg.size);
    for device in &devices {
        let driver = bootstrap.driver(device)?;
        dispatcher.add_device(driver, device.index, cfg.worksize_local());
    }

    let stop = dispatcher.stop_handle();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("stopping after in-flight rounds...");
        stop.stop();
    })?;

    println!("Running...");
    println!();
    dispatcher.run(mode, address, init_code_digest)?;

    if let Some(best) = dispatcher.best_result() {
        println!(
            "Best: score {} salt 0x{} address 0x{}",
            best.score,
            types::encode_hex(&best.salt),
            types::encode_hex(&best.address)
        );
    }
    Ok(())
}

#[cfg(not(feature = "opencl"))]
fn search(
    _cfg: &Config,
    _mode: &Mode,
    _address: [u8; 20],
    _init_code_digest: [u8; 32],
) -> Result<()> {
    bail!("built without OpenCL support, rebuild with --features opencl");
}
