use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-changed=wifi_config.h");

    let mut ssid = String::new();
    let mut password = String::new();

    // Read WiFi configuration if it exists
    let wifi_config_path = "wifi_config.h";
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;

        // Parse SSID
        if let Some(ssid_line) = contents.lines().find(|l| l.contains("#define WIFI_SSID")) {
            if let Some(value) = ssid_line.split('"').nth(1) {
                ssid = value.to_string();
            }
        }

        // Parse Password
        if let Some(pass_line) = contents.lines().find(|l| l.contains("#define WIFI_PASSWORD")) {
            if let Some(value) = pass_line.split('"').nth(1) {
                password = value.to_string();
            }
        }
    } else {
        println!("cargo:warning=wifi_config.h not found, default config will have no station credentials.");
    }

    println!("cargo:rustc-env=WIFI_SSID={}", ssid);
    println!("cargo:rustc-env=WIFI_PASSWORD={}", password);

    Ok(())
}
