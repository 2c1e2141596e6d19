//! Types for use when configuring fcplink modules.

use crate::*;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> FcpResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| FcpError::other_src("encode", e))?,
    )
    .map_err(|e| FcpError::other_src("decode", e))
}

/// Denotes a type used to configure a specific fcplink module.
///
/// Note, the types defined in this struct are specifically for
/// configuration that cannot be changed at runtime, the likes of which
/// might be found in a configuration file.
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

/// Fcplink configuration.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Config(serde_json::Map<String, serde_json::Value>);

impl Config {
    /// When fcplink is generating a default or example configuration
    /// file, the modules that will be used should call this function to
    /// add their default configuration parameters to that file.
    pub fn add_default_module_config<M: ModConfig>(
        &mut self,
        module_name: String,
    ) -> FcpResult<()> {
        if self.0.contains_key(&module_name) {
            return Err(FcpError::other(format!(
                "Refusing to overwrite conflicting module name: {module_name}"
            )));
        }
        self.0.insert(module_name, tc(&M::default())?);
        Ok(())
    }

    /// Extract a module config by name. Note that this config is loaded
    /// from disk and can be edited by humans, so the serialization on
    /// the module config should be tolerant to missing properties,
    /// setting sane defaults.
    pub fn get_module_config<M: ModConfig>(
        &self,
        module_name: &str,
    ) -> FcpResult<M> {
        self.0
            .get(module_name)
            .map(tc)
            .unwrap_or_else(|| Ok(M::default()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct TestMod {
        #[serde(default = "default_limit")]
        rate_limit_bytes_per_sec: i64,
    }

    fn default_limit() -> i64 {
        -1
    }

    impl Default for TestMod {
        fn default() -> Self {
            Self {
                rate_limit_bytes_per_sec: -1,
            }
        }
    }

    impl ModConfig for TestMod {}

    #[test]
    fn config_round_trip_and_defaults() {
        let mut config = Config::default();
        config
            .add_default_module_config::<TestMod>("wireChannel".into())
            .unwrap();

        assert_eq!(
            r#"{"wireChannel":{"rateLimitBytesPerSec":-1}}"#,
            serde_json::to_string(&config).unwrap(),
        );

        // duplicate module names are refused
        assert!(config
            .add_default_module_config::<TestMod>("wireChannel".into())
            .is_err());

        // human-edited configs with extra or missing props still load
        let config: Config = serde_json::from_str(
            r#"{"wireChannel":{"rateLimitBytesPerSec":4096,"extra":true}}"#,
        )
        .unwrap();
        assert_eq!(
            TestMod {
                rate_limit_bytes_per_sec: 4096,
            },
            config.get_module_config::<TestMod>("wireChannel").unwrap(),
        );

        // unset modules get the default
        assert_eq!(
            TestMod::default(),
            config.get_module_config::<TestMod>("NOT-SET").unwrap(),
        );
    }
}
