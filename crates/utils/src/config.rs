use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

/// Environment variable prefix for configuration overrides, e.g. `FOLIO_BATCH__POLL_INTERVAL_SECONDS`.
const ENV_PREFIX: &str = "FOLIO_";

/// Loads the user configuration.
///
/// Values are read from the TOML file at the provided path, with environment variables prefixed
/// by `FOLIO_` taking precedence (nested keys separated by `__`). Secrets such as remote-service
/// credentials are never part of this mapping; gateway implementations read them from the
/// environment directly.
pub fn load_config<T: for<'a> Deserialize<'a>>(
    config_file: impl AsRef<Path>,
) -> figment::Result<T> {
    Figment::from(Toml::file(config_file.as_ref()))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::load_config;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        limit: u32,
    }

    #[test]
    fn reads_toml_with_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("sample.toml", "name = \"folio\"\nlimit = 4")?;
            jail.set_env("FOLIO_LIMIT", "9");

            let sample: Sample = load_config("sample.toml")?;
            assert_eq!(sample, Sample { name: "folio".into(), limit: 9 });
            Ok(())
        });
    }
}
