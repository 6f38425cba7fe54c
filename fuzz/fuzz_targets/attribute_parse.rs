//! Fuzz harness for configuration and product attribute parsing.
//!
//! Arbitrary byte sequences are converted to UTF-8 and fed through
//! `EngineConfig::from_toml` and the typed product attribute
//! accessors. Neither path may panic: malformed input always comes
//! back as `Err` or a default.

#![no_main]
use libfuzzer_sys::fuzz_target;
use tallow_core::catalog::{Product, attr};
use tallow_core::config::EngineConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = EngineConfig::from_toml(s);

        let product = Product::new("fuzz", "fuzz")
            .with_attribute(attr::SOCKETS, s)
            .with_attribute(attr::VCPU, s)
            .with_attribute(attr::STACKING_ID, s)
            .with_attribute(attr::VIRT_LIMIT, s)
            .with_attribute(attr::MULTI_ENTITLEMENT, s)
            .with_attribute(attr::HOST_LIMITED, s)
            .with_attribute(attr::INSTANCE_MULTIPLIER, s);
        let _ = product.sockets();
        let _ = product.vcpu();
        let _ = product.stacking_id();
        let _ = product.virt_limit();
        let _ = product.multi_entitlement();
        let _ = product.host_limited();
        let _ = product.instance_multiplier();
    }
});
