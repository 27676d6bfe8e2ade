//! List the platform devices discovered on the sysfs bus.
//!
//! Run with `RUST_LOG=debug` for per-entry scan logging.

use platform_bus::PLATFORM_BUS;

fn main() {
    env_logger::init();

    let mut bus = PLATFORM_BUS.lock().unwrap();
    if let Err(err) = bus.scan() {
        eprintln!("platform scan failed: {:?}", err);
        std::process::exit(1);
    }

    for dev in bus.devices() {
        println!("{} [{:?}]", dev.name(), dev.kernel_driver());
        for compatible in dev.compatibles() {
            println!("  compatible {}", compatible);
        }
        for res in dev.resources().iter().filter(|res| res.len != 0) {
            println!("  reg {:#x} len {:#x}", res.phys_addr, res.len);
        }
    }
}
