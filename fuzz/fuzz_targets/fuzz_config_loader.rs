#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not.
    let Ok(cfg) = growth_config::load_toml(data) else {
        return;
    };
    if cfg.validate().is_err() {
        return;
    }
    // A config that validates must also convert and pass the job builder's checks.
    let builder = growth_core::JobBuilder::from_config(&cfg)
        .unwrap_or_else(|e| panic!("validated config rejected by reducer lookup: {e}"));
    if let Err(e) = builder.store(growth_core::MemoryStore::new()).try_build() {
        panic!("validated config rejected by builder: {e}");
    }
});
