//! Compile-time defaults, merged by `build.rs` from the library values and
//! an optional `SVCIO_CONFIG_RS` override file.

include!(concat!(env!("OUT_DIR"), "/svcio_merged_config.rs"));
