use std::fs;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use fleet_core::Entity;
use fleet_monitor::{EntitySource, SourceError};
use tracing::info;

/// Reads the wallet registry file. Only `address` and `name` are
/// deserialized; key material in the same records is skipped by the parser.
#[derive(Debug, Clone)]
pub struct WalletFileSource {
    path: PathBuf,
}

impl WalletFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Result<Vec<Entity>, SourceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(event = "wallets_file_missing", path = %self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(SourceError::Unreachable(format!(
                    "{}: {err}",
                    self.path.display()
                )))
            }
        };
        parse_wallets(&contents)
            .map_err(|err| SourceError::Invalid(format!("{}: {err}", self.path.display())))
    }
}

fn parse_wallets(contents: &str) -> Result<Vec<Entity>, serde_json::Error> {
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut entities: Vec<Entity> = serde_json::from_str(contents)?;
    for entity in &mut entities {
        if entity.display_name.trim().is_empty() {
            entity.display_name = entity.id.clone();
        }
    }
    Ok(entities)
}

#[async_trait]
impl EntitySource for WalletFileSource {
    async fn load_entities(&self) -> Result<Vec<Entity>, SourceError> {
        self.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLETS: &str = r#"[
        {
            "name": "Main",
            "address": "0x1111111111111111111111111111111111111111",
            "encrypted_key": "c2VjcmV0",
            "encrypted_mnemonic": null,
            "created_at": "2025-01-02T03:04:05Z"
        },
        {
            "name": "",
            "address": "0x2222222222222222222222222222222222222222",
            "encrypted_key": "c2VjcmV0"
        }
    ]"#;

    #[test]
    fn reads_ids_and_names_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wallets.json");
        fs::write(&path, WALLETS).expect("write wallets");

        let entities = WalletFileSource::new(&path).read().expect("wallets");
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].display_name, "Main");
        assert_eq!(entities[1].display_name, entities[1].id);
    }

    #[test]
    fn missing_file_is_an_empty_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = WalletFileSource::new(dir.path().join("wallets.json"));
        assert_eq!(source.read(), Ok(Vec::new()));
    }

    #[test]
    fn malformed_file_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wallets.json");
        fs::write(&path, "{not json").expect("write wallets");
        assert!(matches!(
            WalletFileSource::new(&path).read(),
            Err(SourceError::Invalid(_))
        ));
    }

    #[test]
    fn empty_address_is_rejected() {
        assert!(parse_wallets(r#"[{"name": "x", "address": ""}]"#).is_err());
    }
}
