pub mod pgp;
pub mod transport;

pub use pgp::FakePgp;
pub use transport::{ScriptHandle, ScriptedTransport};

pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use tern_core::config::ConfigStore;
    use tern_xmpp::Stanza;

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn stanza(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    /// Stanza fixture with every `{key}` placeholder replaced.
    pub fn stanza_with(name: &str, values: &[(&str, &str)]) -> String {
        values
            .iter()
            .fold(stanza(name), |xml, (key, value)| {
                xml.replace(&format!("{{{key}}}"), value)
            })
    }

    pub fn parsed_stanza(name: &str) -> Stanza {
        let xml = stanza(name);
        Stanza::parse(xml.as_bytes())
            .unwrap_or_else(|error| panic!("fixture {name} is not a stanza: {error}"))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    /// A config store loaded from a copy of the fixture in `dir`, so tests
    /// can watch what gets saved.
    pub fn config_store(name: &str, dir: &Path) -> ConfigStore {
        let target = dir.join("config.toml");
        fs::write(&target, config(name))
            .unwrap_or_else(|error| panic!("failed to copy fixture {name}: {error}"));
        ConfigStore::load(target)
            .unwrap_or_else(|error| panic!("fixture {name} is not a valid config: {error}"))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures;

    #[test]
    fn fixture_root_exists() {
        assert!(fixtures::root().is_dir());
    }

    #[test]
    fn loads_stanza_fixture() {
        let stanza = fixtures::parsed_stanza("message-chat.xml");
        assert_eq!(stanza.name(), "message");
        assert_eq!(stanza.thread().as_deref(), Some("th-1"));
    }

    #[test]
    fn fills_placeholders() {
        let xml = fixtures::stanza_with("iq-roster-result.xml", &[("id", "tern-7")]);
        assert!(xml.contains("id='tern-7'"));
        assert!(!xml.contains("{id}"));
    }

    #[test]
    fn loads_config_fixture() {
        let config = fixtures::config("minimal-config.toml");
        let toml: toml::Value =
            toml::from_str(&config).expect("minimal-config.toml should be valid toml");
        assert!(toml.is_table());
    }

    #[test]
    fn config_store_is_backed_by_a_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixtures::config_store("minimal-config.toml", dir.path());
        assert_eq!(store.accounts(), vec!["work".to_string()]);
        assert_eq!(store.path(), Some(dir.path().join("config.toml").as_path()));
    }
}
