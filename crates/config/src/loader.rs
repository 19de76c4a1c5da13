use std::collections::HashSet;
use std::path::Path;

use anyhow::bail;
use indoc::formatdoc;

use crate::Config;

/// Load and validate a configuration file.
pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config: Config = toml::from_str(&content)?;

    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.keys.is_empty() {
        let message = formatdoc! {r#"
            No keys configured. Keymux requires at least one key to dispatch requests.

            Example configuration:

              [[keys]]
              id = "primary"
              value = "{{{{ your secret }}}}"
              quota = {{ period = "monthly", limit = 100000 }}
              rps = 10.0
        "#};

        bail!(message);
    }

    if let Err(reason) = config.pool.validate() {
        bail!("Invalid pool configuration: {reason}");
    }

    let mut seen = HashSet::new();

    for key in &config.keys {
        if let Err(reason) = key.validate() {
            bail!("Invalid configuration for key '{}': {reason}", key.id);
        }

        if !seen.insert(key.id.as_str()) {
            bail!("Duplicate key id '{}'", key.id);
        }
    }

    Ok(())
}
