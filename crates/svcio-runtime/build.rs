//! Build script for svcio-runtime
//!
//! Merges compile-time configuration:
//! 1. Start with library defaults
//! 2. If SVCIO_CONFIG_RS is set, read `pub const NAME: TYPE = VALUE;` lines
//!    from that file and let them override the defaults
//! 3. Write OUT_DIR/svcio_merged_config.rs for `config::defaults`

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "CONCURRENT_THREADS",
        rust_type: "usize",
        default_value: "2",
    },
    ConfigParam {
        name: "MAX_WAIT_MS",
        rust_type: "u64",
        default_value: "100",
    },
    ConfigParam {
        name: "REGISTRY_INITIAL_CAPACITY",
        rust_type: "usize",
        default_value: "64",
    },
    ConfigParam {
        name: "REGISTRY_MAX_SLOTS",
        rust_type: "usize",
        default_value: "0xF_FFFF",
    },
    ConfigParam {
        name: "MONITOR_INTERVAL_MS",
        rust_type: "u64",
        default_value: "5000",
    },
    ConfigParam {
        name: "START_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "5000",
    },
];

fn main() {
    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => dir,
        Err(_) => panic!("OUT_DIR not set"),
    };
    let dest_path = Path::new(&out_dir).join("svcio_merged_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    let user_path = env::var("SVCIO_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", path);
            }
            Err(e) => println!("cargo:warning=Failed to read SVCIO_CONFIG_RS ({}): {}", path, e),
        }
    }
    println!("cargo:rerun-if-env-changed=SVCIO_CONFIG_RS");

    let output = render(&config, user_path.is_some());
    if let Err(e) = fs::write(&dest_path, output) {
        panic!("failed to write merged config: {}", e);
    }
}

fn merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines().map(str::trim) {
        if line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown config parameter: {}", name),
        }
    }
}

/// `pub const NAME: TYPE = VALUE;` → (NAME, VALUE)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    if value.is_empty() {
        return None;
    }
    Some((name.trim().to_string(), value.to_string()))
}

fn render(config: &HashMap<&str, String>, custom: bool) -> String {
    let mut output = String::from("// Generated by svcio-runtime/build.rs\n");
    if custom {
        output.push_str("// Includes overrides from SVCIO_CONFIG_RS\n");
    }
    output.push('\n');
    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }
    output
}
