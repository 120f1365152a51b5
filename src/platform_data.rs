//! Host platform data pushed into the engine at startup.
use serde::Serialize;

/// Describes the SDK and the host it runs on. Set once per client; the
/// engine attaches it to generated events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformData {
    pub sdk_type: String,
    pub sdk_version: String,
    pub platform: String,
    pub platform_version: String,
    pub device_model: String,
    pub hostname: String,
}

impl PlatformData {
    /// Platform data for this SDK build and host.
    pub fn default_platform_data() -> PlatformData {
        PlatformData {
            sdk_type: "server".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
            platform: "Rust".to_owned(),
            platform_version: env!("CARGO_PKG_RUST_VERSION").to_owned(),
            device_model: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PlatformData;

    #[test]
    fn wire_format_uses_camel_case() {
        let json = serde_json::to_value(PlatformData::default_platform_data()).unwrap();
        assert_eq!(json["sdkType"], "server");
        assert_eq!(json["platform"], "Rust");
        assert!(json.get("sdkVersion").is_some());
        assert!(json.get("platformVersion").is_some());
    }
}
