//! Load the `[env]` table from `<config dir>/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

fn config_path(app_name: &str) -> Option<PathBuf> {
    // dirs honors XDG_CONFIG_HOME on Linux, the platform convention elsewhere.
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    let path = base.join(app_name).join("config.toml");
    path.is_file().then_some(path)
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Returns the `[env]` pairs. Missing file or missing section is an empty map.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let Some(path) = config_path(app_name) else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let file: ConfigFile = toml::from_str(&content)?;
    Ok(file.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn with_xdg_home<T>(dir: &std::path::Path, f: impl FnOnce() -> T) -> T {
        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir);
        let out = f();
        match prev {
            Some(p) => env::set_var("XDG_CONFIG_HOME", p),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
        out
    }

    #[test]
    fn missing_config_returns_empty_map() {
        let map = load_env_map("cortex-config-test-nonexistent-9f1").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn reads_env_table() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("cortex");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(
            app.join("config.toml"),
            "[env]\nCORTEX_LLM_URL = \"http://gw:9000\"\n",
        )
        .unwrap();
        let map = with_xdg_home(dir.path(), || load_env_map("cortex")).unwrap();
        assert_eq!(
            map.get("CORTEX_LLM_URL").map(String::as_str),
            Some("http://gw:9000")
        );
    }

    #[test]
    fn config_without_env_section_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("cortex");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("config.toml"), "[other]\nk = \"v\"\n").unwrap();
        let map = with_xdg_home(dir.path(), || load_env_map("cortex")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("cortex");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("config.toml"), "not toml [[[\n").unwrap();
        let res = with_xdg_home(dir.path(), || load_env_map("cortex"));
        assert!(matches!(res, Err(LoadError::XdgParse(_))));
    }
}
