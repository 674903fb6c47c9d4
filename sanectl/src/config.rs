use anyhow::Context;
use bstr::BString;
use libsane_engine::{DialectKind, ReaderConfig};
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default, rename = "device")]
    pub devices: Vec<Device>,

    /// Option overrides by device path.
    #[serde(default = "Default::default")]
    pub options: HashMap<String, HashMap<BString, BString>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub path: String,

    /// Skip INQUIRY based detection.
    pub dialect: Option<DialectKind>,

    #[serde(flatten)]
    pub reader: ReaderConfig,
}

impl Config {
    pub fn read_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let dpath = path.display();

        let raw = fs::read_to_string(path).with_context(|| format!("reading file '{dpath}'"))?;
        let config = toml::from_str(&raw).with_context(|| format!("parsing file '{dpath}'"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_devices_and_options() {
        let config: Config = toml::from_str(
            r#"
            [[device]]
            path = "/dev/sg2"
            dialect = "teco"
            overlapped = true
            buffers = 2

            [[device]]
            path = "/dev/sg3"

            [options."/dev/sg2"]
            mode = "Color"
            resolution = "300"
            "#,
        )
        .unwrap();

        assert_eq!(config.devices.len(), 2);

        let teco = &config.devices[0];
        assert_eq!(teco.path, "/dev/sg2");
        assert_eq!(teco.dialect, Some(DialectKind::Teco));
        assert_eq!(
            teco.reader,
            ReaderConfig {
                overlapped: true,
                buffers: 2,
                ..ReaderConfig::default()
            }
        );

        let other = &config.devices[1];
        assert_eq!(other.dialect, None);
        assert_eq!(other.reader, ReaderConfig::default());

        let options = &config.options["/dev/sg2"];
        assert_eq!(options.get(&BString::from("mode")), Some(&BString::from("Color")));
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn test_unknown_dialect_rejected() {
        let result = toml::from_str::<Config>(
            r#"
            [[device]]
            path = "/dev/sg2"
            dialect = "epson"
            "#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = Config::read_from("/nonexistent/sanectl.toml").unwrap_err();

        assert_eq!(err.to_string(), "reading file '/nonexistent/sanectl.toml'");
    }
}
